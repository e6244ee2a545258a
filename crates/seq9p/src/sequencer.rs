//! Trees of pipelined sequences.
//!
//! A [`Sequencer`] accepts operations without waiting for their replies. It
//! may open nested subsequencers, each with its own result channel; all
//! operations of a tree go out on one pipeline per connection, so their
//! results arrive in submission order and are routed to the sequencer that
//! submitted them. When a subsequencer has ended and all its results have been
//! delivered its channel closes, and the value it reports with
//! [`Sequencer::result`] is delivered to its parent as one more result.
//!
//! The first error anywhere in the tree fails the whole tree. The node that
//! was receiving results when it happened gets the error; every enclosing node
//! and everything else still open gets [`Error::Aborted`]. Operations
//! submitted after a failure are accepted and silently dropped, so a producer
//! only learns of the failure through its own result channel.
//!
//! A tree has one producer at a time: basic operations and `end` must not be
//! called concurrently on sequencers of the same tree.

use {
    crate::{
        conn::Conn,
        error::Error,
        fid::Fid,
        phase::{PhaseTracker, ROOT},
        req::{BasicReq, Req, SeqResult},
        sequence::ConnSequence,
        utils::Result,
    },
    log::{debug, error, warn},
    std::{
        collections::HashMap,
        fmt,
        sync::{
            Arc, Mutex, MutexGuard,
            atomic::{AtomicBool, Ordering},
        },
    },
    tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Messages from the tree's handles to its replier.
enum Request {
    /// One basic operation was submitted by the innermost open sequencer.
    Op,
    Begin(Port),
    End,
    /// A local failure, to be propagated through the tree.
    Fail(Error),
}

type SeqReply = oneshot::Sender<Result<Option<Arc<ConnSequence>>>>;

/// The replier's end of a sequencer.
struct Port {
    name: String,
    results: Option<mpsc::UnboundedSender<SeqResult>>,
    result: Option<oneshot::Receiver<Result<SeqResult>>>,
    error: Arc<Mutex<Option<Error>>>,
}

impl Port {
    fn forward(&self, r: SeqResult) {
        if let Some(tx) = &self.results {
            let _ = tx.send(r);
        }
    }

    fn close(&mut self) {
        self.results = None;
    }

    fn set_error(&self, e: Error) {
        *lock(&self.error) = Some(e);
    }

    fn abort(mut self, e: Error) {
        debug!("aborting {}: {}", self.name, e);
        self.set_error(e);
        self.close();
    }
}

/// The handle's side of a sequencer.
struct SeqShared {
    name: String,
    error: Arc<Mutex<Option<Error>>>,
    result: Mutex<Option<oneshot::Sender<Result<SeqResult>>>>,
    ended: AtomicBool,
    root: bool,
}

#[derive(Default)]
struct MainState {
    curr: Option<Arc<ConnSequence>>,
    shutdown: bool,
}

/// State shared by every handle of one tree.
struct Main {
    requests: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    conns: mpsc::UnboundedSender<(Conn, SeqReply)>,
    state: Arc<AsyncMutex<MainState>>,
    done: watch::Receiver<Option<Result<()>>>,
    cause: Arc<Mutex<Option<Error>>>,
    entered: AtomicBool,
}

struct Entered<'a>(&'a AtomicBool);

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Main {
    fn enter(&self) -> Entered<'_> {
        if self.entered.swap(true, Ordering::Acquire) {
            panic!("sequencer tree used by two producers at once");
        }
        Entered(&self.entered)
    }

    fn submit(&self, r: Request) -> std::result::Result<(), Request> {
        match lock(&self.requests).as_ref() {
            Some(tx) => tx.send(r).map_err(|e| e.0),
            None => Err(r),
        }
    }

    fn fail(&self, e: Error) {
        let _ = self.submit(Request::Fail(e));
    }

    async fn exchange(&self, conn: &Conn) -> Result<Option<Arc<ConnSequence>>> {
        let (tx, rx) = oneshot::channel();
        self.conns
            .send((conn.clone(), tx))
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }
}

/// A handle on one node of a sequencer tree.
///
/// Clones refer to the same node.
#[derive(Clone)]
pub struct Sequencer {
    shared: Arc<SeqShared>,
    main: Arc<Main>,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("name", &self.shared.name)
            .field("ended", &self.shared.ended.load(Ordering::Relaxed))
            .finish()
    }
}

impl Sequencer {
    /// Start a new tree. Must be called inside a tokio runtime.
    ///
    /// The receiver yields the root's results and closes when the tree has
    /// finished or failed.
    pub fn new() -> (Sequencer, mpsc::UnboundedReceiver<SeqResult>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (conns_tx, conns_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(None);
        let error = Arc::new(Mutex::new(None));
        let state = Arc::new(AsyncMutex::new(MainState::default()));
        let cause = Arc::new(Mutex::new(None));

        let root = Port {
            name: "root".to_owned(),
            results: Some(results_tx),
            result: None,
            error: error.clone(),
        };
        let replier = Replier {
            requests: Some(requests_rx),
            conns: conns_rx,
            sequences: HashMap::new(),
            curr: None,
            phases: PhaseTracker::new(root),
            state: state.clone(),
            cause: cause.clone(),
            done: done_tx,
        };
        tokio::spawn(replier.run());

        let seq = Sequencer {
            shared: Arc::new(SeqShared {
                name: "root".to_owned(),
                error,
                result: Mutex::new(None),
                ended: AtomicBool::new(false),
                root: true,
            }),
            main: Arc::new(Main {
                requests: Mutex::new(Some(requests_tx)),
                conns: conns_tx,
                state,
                done: done_rx,
                cause,
                entered: AtomicBool::new(false),
            }),
        };
        (seq, results_rx)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Open a child of the innermost open sequencer of this tree.
    ///
    /// Operations on the child are pipelined with everything else in the tree.
    /// The child's receiver closes once it has ended and all its results have
    /// arrived; whatever the child then passes to [`Sequencer::result`] becomes
    /// one result of its parent.
    pub fn subsequencer(&self, name: &str) -> (Sequencer, mpsc::UnboundedReceiver<SeqResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let error = Arc::new(Mutex::new(None));

        let shared = Arc::new(SeqShared {
            name: name.to_owned(),
            error: error.clone(),
            result: Mutex::new(Some(result_tx)),
            ended: AtomicBool::new(false),
            root: false,
        });
        let port = Port {
            name: name.to_owned(),
            results: Some(results_tx),
            result: Some(result_rx),
            error,
        };
        if self.main.submit(Request::Begin(port)).is_err() {
            // The tree is gone; dropping the port closed the channel.
            *lock(&shared.error) = Some(Error::Terminated);
            shared.ended.store(true, Ordering::Release);
        }

        let seq = Sequencer {
            shared,
            main: self.main.clone(),
        };
        (seq, results_rx)
    }

    /// Submit an operation on `file`.
    ///
    /// Returns once a basic operation has been written, without waiting for
    /// its reply. A composite runs to the end of its submissions.
    pub async fn do_op(&self, file: Option<&Fid>, req: impl Into<Req>) -> Result<()> {
        match req.into() {
            Req::Composite(c) => c.run(self, file).await,
            Req::Basic(op) => {
                let _entered = self.main.enter();
                self.do_basic(file, op).await
            }
        }
    }

    async fn do_basic(&self, file: Option<&Fid>, op: BasicReq) -> Result<()> {
        if self.shared.ended.load(Ordering::Acquire) || lock(&self.main.requests).is_none() {
            return Err(Error::Terminated);
        }

        let mut st = self.main.state.lock().await;
        if st.shutdown {
            return Err(Error::Terminated);
        }

        if let Some(f) = file {
            let key = f.conn().key();
            if st.curr.as_ref().map(|s| s.conn().key()) != Some(key) {
                st.curr = self
                    .main
                    .exchange(f.conn())
                    .await
                    .inspect_err(|e| self.main.fail(e.clone()))?;
            }
        }

        let Some(curr) = st.curr.clone() else {
            debug!("{}: no sequence, ignoring {:?}", self.shared.name, op);
            return Ok(());
        };
        // Nothing is counted as pending until the request is known to fit.
        let out = curr
            .check(file, &op)
            .and_then(|()| curr.prepare(file, Some(op)))
            .inspect_err(|e| self.main.fail(e.clone()))?;
        if self.main.submit(Request::Op).is_err() {
            return Err(Error::Terminated);
        }
        curr.commit(file, out)
            .await
            .inspect_err(|e| self.main.fail(e.clone()))
    }

    /// Declare that no more operations will be submitted on this sequencer.
    ///
    /// Ending the root ends the tree. Ending twice has no effect.
    pub fn end(&self) {
        let _entered = self.main.enter();
        if self.shared.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.root {
            lock(&self.main.requests).take();
        } else if self.main.submit(Request::End).is_err() {
            warn!("{}: ended after its tree", self.shared.name);
        }
    }

    /// Report the value this subsequencer contributes to its parent.
    ///
    /// Called once, after the result channel has closed. An error also becomes
    /// the sequencer's error.
    pub fn result(&self, r: Result<SeqResult>) {
        if let Err(e) = &r {
            *lock(&self.shared.error) = Some(e.clone());
        }
        match lock(&self.shared.result).take() {
            Some(tx) => {
                let _ = tx.send(r);
            }
            None if self.shared.root => {}
            None => warn!("{}: result reported twice", self.shared.name),
        }
    }

    /// The error this sequencer was closed with, if any.
    pub fn error(&self) -> Option<Error> {
        lock(&self.shared.error).clone()
    }

    /// The error that failed the tree, wherever it happened.
    pub fn cause(&self) -> Option<Error> {
        lock(&self.main.cause).clone()
    }

    /// Wait for the whole tree to finish. Fids used by the tree are settled
    /// by the time this returns.
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.main.done.clone();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Hungup)?
            .clone();
        outcome.unwrap_or(Ok(()))
    }
}

struct Entry {
    seq: Arc<ConnSequence>,
    results: mpsc::UnboundedReceiver<SeqResult>,
}

enum Event {
    Request(Request),
    RootEnd,
    Conn(Conn, SeqReply),
    Result(Option<SeqResult>),
}

/// The task that owns a tree's bookkeeping.
struct Replier {
    requests: Option<mpsc::UnboundedReceiver<Request>>,
    conns: mpsc::UnboundedReceiver<(Conn, SeqReply)>,
    sequences: HashMap<usize, Entry>,
    curr: Option<usize>,
    phases: PhaseTracker<Port>,
    state: Arc<AsyncMutex<MainState>>,
    cause: Arc<Mutex<Option<Error>>>,
    done: watch::Sender<Option<Result<()>>>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_results(sequences: &mut HashMap<usize, Entry>, curr: Option<usize>) -> Option<SeqResult> {
    match curr.and_then(|k| sequences.get_mut(&k)) {
        Some(e) => e.results.recv().await,
        None => std::future::pending().await,
    }
}

impl Replier {
    async fn run(mut self) {
        let outcome = match self.serve().await {
            Ok(()) => {
                self.close_sequences(true).await;
                Ok(())
            }
            Err(e) => {
                debug!("sequencer tree failed: {}", e);
                *lock(&self.cause) = Some(e.clone());
                self.propagate_error(e.clone()).await;
                while self.requests.is_some() {
                    self.service_failed().await;
                }
                self.close_sequences(false).await;
                Err(e)
            }
        };
        // Closes the root's channel if it is still open.
        self.phases.take(ROOT);
        let _ = self.done.send(Some(outcome));
    }

    async fn next_event(&mut self) -> Event {
        let idle = self.phases.total_pending() == 0;
        tokio::select! {
            biased;
            r = recv_opt(&mut self.requests) => match r {
                Some(r) => Event::Request(r),
                None => Event::RootEnd,
            },
            Some((conn, reply)) = self.conns.recv(), if idle => Event::Conn(conn, reply),
            r = recv_results(&mut self.sequences, self.curr) => Event::Result(r),
        }
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            if self.requests.is_none() && self.phases.total_pending() == 0 {
                return Ok(());
            }
            match self.next_event().await {
                Event::Request(Request::Op) => {
                    if !self.phases.submit() {
                        error!("operation submitted after the root ended");
                    }
                }
                Event::Request(Request::Begin(port)) => {
                    self.phases.begin(port);
                }
                Event::Request(Request::End) => {
                    if !self.phases.end_subsequence() {
                        error!("end without an open subsequence");
                    }
                }
                Event::Request(Request::Fail(e)) => return Err(e),
                Event::RootEnd => {
                    self.requests = None;
                    if !self.phases.end_root() {
                        error!("root ended with subsequences still open");
                        return Err(Error::Aborted);
                    }
                }
                Event::Conn(conn, reply) => {
                    let r = self.sequence_for(&conn).await;
                    let _ = reply.send(r.map(Some));
                }
                Event::Result(Some(r)) => {
                    let head = self.phases.head();
                    if !self.phases.reply() {
                        error!("result with nothing pending: {:?}", r);
                    } else if let Some(port) = self.phases.value(head) {
                        port.forward(r);
                    }
                }
                Event::Result(None) => {
                    let e = self
                        .curr
                        .and_then(|k| self.sequences.get(&k))
                        .and_then(|e| e.seq.error())
                        .unwrap_or(Error::Aborted);
                    return Err(e);
                }
            }
            self.close_subsequences().await?;
        }
    }

    /// Make the sequence on `conn` current, starting one if needed.
    async fn sequence_for(&mut self, conn: &Conn) -> Result<Arc<ConnSequence>> {
        let key = conn.key();
        if !self.sequences.contains_key(&key) {
            let (seq, results) = ConnSequence::start(conn).await?;
            self.sequences.insert(key, Entry { seq, results });
        }
        self.curr = Some(key);
        self.sequences
            .get(&key)
            .map(|e| e.seq.clone())
            .ok_or(Error::Terminated)
    }

    /// Deliver the values of subsequences that have finished to their parents.
    async fn close_subsequences(&mut self) -> Result<()> {
        while let Some(idx) = self.phases.next_finished() {
            let Some(mut port) = self.phases.take(idx) else {
                continue;
            };
            port.close();
            let Some(rx) = port.result.take() else {
                continue;
            };
            match rx.await {
                Ok(Ok(v)) => {
                    let parent = self.phases.parent(idx).and_then(|p| self.phases.value(p));
                    if let Some(parent) = parent {
                        parent.forward(v);
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    error!("{} was dropped without reporting a result", port.name);
                    return Err(Error::Aborted);
                }
            }
        }
        Ok(())
    }

    async fn propagate_error(&mut self, err: Error) {
        let chain = self.phases.mark_final();
        for idx in self.phases.unfinished_non_final() {
            if let Some(port) = self.phases.take(idx) {
                port.abort(Error::Aborted);
            }
        }

        let mut err = err;
        for idx in chain {
            if let Some(port) = self.phases.value_mut(idx) {
                port.set_error(err.clone());
                port.close();
            }
            // The producer still has to end the node; keep servicing it until then.
            while !self.phases.is_closed(idx) && self.requests.is_some() {
                self.service_failed().await;
            }

            let Some(mut port) = self.phases.take(idx) else {
                continue;
            };
            let parent = self.phases.parent(idx);
            if let (Some(parent), Some(rx)) = (parent, port.result.take()) {
                if let Ok(Ok(v)) = rx.await {
                    if let Some(p) = self.phases.value(parent) {
                        p.forward(v);
                    }
                }
            }
            err = Error::Aborted;
        }
    }

    /// Handle one request of a failed tree. New subsequences are closed at once.
    async fn service_failed(&mut self) {
        let ev = tokio::select! {
            biased;
            r = recv_opt(&mut self.requests) => match r {
                Some(r) => Event::Request(r),
                None => Event::RootEnd,
            },
            Some((conn, reply)) = self.conns.recv() => Event::Conn(conn, reply),
        };
        match ev {
            Event::Request(Request::Begin(port)) => {
                let idx = self.phases.begin(port);
                if let Some(port) = self.phases.take(idx) {
                    port.abort(Error::Aborted);
                }
            }
            Event::Request(Request::End) => {
                self.phases.end_subsequence();
            }
            Event::RootEnd => {
                self.requests = None;
                self.phases.end_root();
            }
            Event::Conn(_, reply) => {
                let _ = reply.send(Ok(None));
            }
            Event::Request(Request::Op | Request::Fail(_)) | Event::Result(_) => {}
        }
    }

    /// End every connection sequence of the tree and wait for the server to
    /// acknowledge. Sequences that have not failed are flushed first unless
    /// the tree succeeded.
    async fn close_sequences(&mut self, ok: bool) {
        let seqs: Vec<Arc<ConnSequence>> = self.sequences.values().map(|e| e.seq.clone()).collect();
        {
            let mut st = self.state.lock().await;
            st.shutdown = true;
            st.curr = None;
            for seq in &seqs {
                if !ok && seq.error().is_none() {
                    if let Err(err) = seq.send(None, Some(BasicReq::Abort)).await {
                        debug!("flushing sequence {}: {}", seq.id(), err);
                    }
                }
                if let Err(err) = seq.send(None, None).await {
                    debug!("ending sequence {}: {}", seq.id(), err);
                }
            }
        }
        for seq in &seqs {
            seq.finished().await;
        }
    }
}
