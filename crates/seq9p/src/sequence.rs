//! A sequence of requests pipelined on one connection.
//!
//! Every request of a sequence shares one tag. The server executes them in
//! order and stops at the first failure, after which it discards everything up
//! to `Tend`. Fids cloned inside the sequence belong to it until it ends: on
//! success they become ordinary fids, on failure the server clunks them and
//! they are released locally.

use {
    crate::{
        conn::Conn,
        error::Error,
        fcall::*,
        fid::{Fid, FidState},
        queue::Queue,
        req::{BasicReq, SeqResult},
        utils::Result,
    },
    bytes::Bytes,
    log::{debug, error, warn},
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex, MutexGuard,
            atomic::{AtomicU64, Ordering},
        },
    },
    tokio::sync::{mpsc, watch},
};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// An encoded request waiting to be committed to the sequence.
#[derive(Debug)]
pub struct Outgoing {
    msg: Msg,
    frame: Bytes,
    op: Option<BasicReq>,
}

#[derive(Debug)]
struct PendingReq {
    fid: Option<Fid>,
    op: Option<BasicReq>,
    typ: MsgType,
}

struct SeqState {
    fids: HashMap<u32, Fid>,
    do_eof: bool,
    reply_eof: bool,
    queue: Queue<PendingReq>,
    err: Option<Error>,
}

enum Reply {
    Result(SeqResult),
    Nothing,
    Failed,
    End,
}

/// One connection's share of a sequencer tree.
pub struct ConnSequence {
    conn: Conn,
    tag: u16,
    id: u64,
    state: Mutex<SeqState>,
    finished: watch::Receiver<bool>,
}

impl std::fmt::Debug for ConnSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnSequence")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .finish()
    }
}

impl ConnSequence {
    /// Begin a sequence on `conn`. Results of successful operations arrive on
    /// the returned channel, which closes when the sequence ends or fails.
    pub async fn start(conn: &Conn) -> Result<(Arc<ConnSequence>, mpsc::UnboundedReceiver<SeqResult>)> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let tag = conn.newtag(reply_tx)?;
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (done_tx, finished) = watch::channel(false);

        let seq = Arc::new(ConnSequence {
            conn: conn.clone(),
            tag,
            id: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SeqState {
                fids: HashMap::new(),
                do_eof: false,
                reply_eof: false,
                queue: Queue::new(),
                err: None,
            }),
            finished,
        });
        tokio::spawn(seq.clone().replies(reply_rx, results_tx, done_tx));

        let mut w = conn.lock_writer().await;
        seq.lock().queue.put(PendingReq {
            fid: None,
            op: None,
            typ: MsgType::TBegin,
        });
        conn.write_with(&mut w, &Msg { tag, body: FCall::TBegin }).await?;
        debug!("sequence {} started on tag {}", seq.id, tag);

        Ok((seq, results_rx))
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The error that terminated the sequence, if any.
    pub fn error(&self) -> Option<Error> {
        self.lock().err.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SeqState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate an operation before it is counted or sent.
    pub fn check(&self, file: Option<&Fid>, op: &BasicReq) -> Result<()> {
        match file {
            Some(f) => {
                if f.conn().key() != self.conn.key() {
                    return Err(Error::InvalidInput(
                        "file belongs to another connection".to_owned(),
                    ));
                }
                match f.state() {
                    FidState::SeqPending(s) | FidState::SeqAlloc(s, _) if s != self.id => {
                        return Err(Error::FidBusy);
                    }
                    FidState::Pending => return Err(Error::FidBusy),
                    FidState::Free | FidState::Clunked => return Err(Error::BadFid),
                    _ => {}
                }
            }
            None if !matches!(op, BasicReq::Abort) => {
                return Err(Error::InvalidInput(format!("{:?} needs a file", op)));
            }
            None => {}
        }

        let max = self.conn.iounit() as usize;
        match op {
            BasicReq::Clone { newfid } => {
                if newfid.state() != FidState::Free || newfid.conn().key() != self.conn.key() {
                    return Err(Error::FidInUse);
                }
            }
            BasicReq::Read { buf, .. } if buf.len() > max => {
                return Err(Error::InvalidInput(format!(
                    "read of {} bytes exceeds iounit {}",
                    buf.len(),
                    max
                )));
            }
            BasicReq::Write { data, .. } if data.len() > max => {
                return Err(Error::InvalidInput(format!(
                    "write of {} bytes exceeds iounit {}",
                    data.len(),
                    max
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Send `op` on `file` as part of the sequence; `None` ends the sequence.
    pub async fn send(&self, file: Option<&Fid>, op: Option<BasicReq>) -> Result<()> {
        let out = self.prepare(file, op)?;
        self.commit(file, out).await
    }

    /// Encode `op` without touching the sequence. A message the connection
    /// cannot carry is refused here, before anything waits for its reply.
    pub fn prepare(&self, file: Option<&Fid>, op: Option<BasicReq>) -> Result<Outgoing> {
        let fid = file.map(Fid::id).unwrap_or(NOFID);
        let (body, op) = match op {
            None => (FCall::TEnd, None),
            Some(op) => {
                let (body, kept) = self.request(fid, op);
                (body, Some(kept))
            }
        };
        let msg = Msg { tag: self.tag, body };
        let frame = self.conn.encode(&msg)?;
        Ok(Outgoing { msg, frame, op })
    }

    /// Queue a prepared request for its reply and write it.
    ///
    /// Operations committed after the sequence has failed are dropped without
    /// error: the failure is reported through the sequence itself.
    pub async fn commit(&self, file: Option<&Fid>, out: Outgoing) -> Result<()> {
        let Outgoing { msg, frame, op } = out;
        let is_end = op.is_none();

        let mut w = self.conn.lock_writer().await;
        {
            let mut st = self.lock();
            if st.do_eof {
                return Err(Error::Terminated);
            }
            if st.err.is_some() && !is_end {
                debug!("sequence {} failed, dropping {:?}", self.id, op);
                return Ok(());
            }
            if is_end {
                st.do_eof = true;
            }
            if let Some(BasicReq::Clone { newfid }) = &op {
                newfid.set_state(FidState::SeqPending(self.id));
                st.fids.insert(newfid.id(), newfid.clone());
            }
            st.queue.put(PendingReq {
                fid: file.cloned(),
                typ: MsgType::from(&msg.body),
                op,
            });
        }

        if let Err(e) = self.conn.write_frame(&mut w, frame).await {
            self.retract();
            return Err(e);
        }
        debug!("\t→ {:?}", msg);
        drop(w);

        if is_end {
            self.putfids();
        }
        Ok(())
    }

    /// Take back the last queued request, which never reached the server.
    fn retract(&self) {
        let mut st = self.lock();
        if let Some(PendingReq {
            op: Some(BasicReq::Clone { newfid }),
            ..
        }) = st.queue.take_last()
        {
            st.fids.remove(&newfid.id());
            self.conn.putfid(&newfid);
        }
    }

    /// Build the wire request for `op`, and what to remember of it until the reply.
    fn request(&self, fid: u32, mut op: BasicReq) -> (FCall, BasicReq) {
        let body = match &mut op {
            BasicReq::Clone { newfid } => FCall::TWalk {
                fid,
                newfid: newfid.id(),
                wnames: Vec::new(),
            },
            BasicReq::Create { name, perm, mode } => FCall::TCreate {
                fid,
                name: name.clone(),
                perm: *perm,
                mode: *mode,
            },
            BasicReq::Walk { name } => FCall::TWalk {
                fid,
                newfid: fid,
                wnames: vec![name.clone()],
            },
            BasicReq::Open { mode } => FCall::TOpen { fid, mode: *mode },
            BasicReq::Read { buf, offset } => FCall::TRead {
                fid,
                offset: *offset,
                count: buf.len() as u32,
            },
            // The payload moves into the message; only the offset is kept.
            BasicReq::Write { data, offset } => FCall::TWrite {
                fid,
                offset: *offset,
                data: Data(std::mem::take(data)),
            },
            BasicReq::Stat => FCall::TStat { fid },
            BasicReq::Wstat { stat } => FCall::TWStat {
                fid,
                stat: stat.clone(),
            },
            BasicReq::Remove => FCall::TRemove { fid },
            BasicReq::Clunk => FCall::TClunk { fid },
            BasicReq::Abort => FCall::TFlush { oldtag: self.tag },
            BasicReq::Nonseq => FCall::TNonseq { fid },
        };
        (body, op)
    }

    /// Wait until the server has acknowledged the end of the sequence, or the
    /// connection has failed.
    pub async fn finished(&self) {
        let mut rx = self.finished.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn replies(
        self: Arc<Self>,
        mut replies: mpsc::UnboundedReceiver<Msg>,
        results: mpsc::UnboundedSender<SeqResult>,
        done: watch::Sender<bool>,
    ) {
        let mut results = Some(results);
        let mut hungup = false;
        loop {
            let Some(msg) = replies.recv().await else {
                let e = self.conn.error().unwrap_or(Error::Hungup);
                debug!("sequence {} lost its connection: {}", self.id, e);
                self.lock().err.get_or_insert(e);
                hungup = true;
                break;
            };
            match self.reply(msg.body) {
                Reply::Result(r) => {
                    if let Some(tx) = &results {
                        let _ = tx.send(r);
                    }
                }
                Reply::Nothing => {}
                Reply::Failed => results = None,
                Reply::End => break,
            }
        }

        drop(results);
        self.lock().reply_eof = true;
        self.putfids();
        if !hungup {
            self.conn.puttag(self.tag);
        }
        debug!("sequence {} finished", self.id);
        let _ = done.send(true);
    }

    fn reply(&self, body: FCall) -> Reply {
        let mut st = self.lock();

        if let FCall::REnd = body {
            while let Some(rq) = st.queue.get() {
                if rq.typ == MsgType::TEnd {
                    break;
                }
            }
            return Reply::End;
        }

        let Some(rq) = st.queue.get() else {
            warn!("sequence {}: reply {:?} with nothing pending", self.id, MsgType::from(&body));
            return Reply::Nothing;
        };

        if rq.typ == MsgType::TEnd {
            let e = match body {
                FCall::RError { ename } => Error::Server(ename),
                body => self
                    .conn
                    .protocol_error(format!("{:?} in reply to Tend", MsgType::from(&body))),
            };
            st.err.get_or_insert(e);
            return Reply::End;
        }

        match body {
            FCall::RError { ename } => {
                self.unwind(&mut st, &rq);
                return self.fail(&mut st, Error::Server(ename));
            }
            FCall::RFlush if rq.typ == MsgType::TFlush => {
                return self.fail(&mut st, Error::Aborted);
            }
            _ => {}
        }

        if st.err.is_some() {
            return Reply::Nothing;
        }

        if rq.typ.reply() != Some(MsgType::from(&body)) {
            let e = self.conn.protocol_error(format!(
                "sequence {}: {:?} in reply to {:?}",
                self.id,
                MsgType::from(&body),
                rq.typ
            ));
            st.err = Some(e);
            return Reply::Failed;
        }

        // Every fixup error is a reply the protocol does not allow.
        match self.fixup(&mut st, rq, body) {
            Ok(Some(r)) => Reply::Result(r),
            Ok(None) => Reply::Nothing,
            Err(e) => {
                error!("sequence {}: {}", self.id, e);
                self.conn.fail(e.clone());
                st.err = Some(e);
                Reply::Failed
            }
        }
    }

    /// Mark the sequence failed. The server discards everything up to `Tend`.
    fn fail(&self, st: &mut SeqState, e: Error) -> Reply {
        debug!("sequence {} failed: {}", self.id, e);
        st.err.get_or_insert(e);
        st.queue.retain(|rq| rq.typ == MsgType::TEnd);
        Reply::Failed
    }

    /// Undo local bookkeeping for a request the server rejected.
    fn unwind(&self, st: &mut SeqState, rq: &PendingReq) {
        match (&rq.op, &rq.fid) {
            (Some(BasicReq::Clone { newfid }), _) => {
                st.fids.remove(&newfid.id());
                self.conn.putfid(newfid);
            }
            // The server clunks a fid even when the remove fails.
            (Some(BasicReq::Remove), Some(f)) => {
                st.fids.remove(&f.id());
                self.conn.putfid(f);
            }
            _ => {}
        }
    }

    /// Apply the effects of a successful reply and produce its result.
    fn fixup(&self, st: &mut SeqState, rq: PendingReq, body: FCall) -> Result<Option<SeqResult>> {
        let Some(op) = rq.op else {
            // Tbegin
            return Ok(None);
        };
        let file = rq.fid;

        let r = match (op, body) {
            (BasicReq::Clone { newfid }, FCall::RWalk { wqids }) => {
                if !wqids.is_empty() {
                    return Err(Error::Protocol(format!("clone returned {} qids", wqids.len())));
                }
                if let Some(f) = &file {
                    newfid.copy_from(f, FidState::SeqAlloc(self.id, false));
                }
                SeqResult::Clone
            }
            (BasicReq::Walk { name }, FCall::RWalk { wqids }) => {
                let &[qid] = wqids.as_slice() else {
                    return Err(Error::Protocol(format!(
                        "walk of {:?} returned {} qids",
                        name,
                        wqids.len()
                    )));
                };
                if let Some(f) = &file {
                    f.set_qid(qid);
                }
                SeqResult::Walk(qid)
            }
            (BasicReq::Open { mode }, FCall::ROpen { qid, iounit }) => {
                if let Some(f) = &file {
                    f.set_open(qid, mode, iounit);
                }
                SeqResult::Open(qid)
            }
            (BasicReq::Create { mode, .. }, FCall::RCreate { qid, iounit }) => {
                if let Some(f) = &file {
                    f.set_open(qid, mode, iounit);
                }
                SeqResult::Create(qid)
            }
            (BasicReq::Read { mut buf, .. }, FCall::RRead { data }) => {
                if data.0.len() > buf.len() {
                    return Err(Error::Protocol(format!(
                        "read of {} bytes returned {}",
                        buf.len(),
                        data.0.len()
                    )));
                }
                buf[..data.0.len()].copy_from_slice(&data.0);
                buf.truncate(data.0.len());
                SeqResult::Read(buf)
            }
            (BasicReq::Write { .. }, FCall::RWrite { count }) => SeqResult::Write(count),
            (BasicReq::Stat, FCall::RStat { stat }) => SeqResult::Stat(stat),
            (BasicReq::Wstat { .. }, FCall::RWStat) => SeqResult::Wstat,
            (BasicReq::Remove, FCall::RRemove) => {
                self.release(st, file.as_ref());
                SeqResult::Remove
            }
            (BasicReq::Clunk, FCall::RClunk) => {
                self.release(st, file.as_ref());
                SeqResult::Clunk
            }
            (BasicReq::Nonseq, FCall::RNonseq) => {
                if let Some(f) = &file {
                    st.fids.remove(&f.id());
                    if let FidState::SeqAlloc(_, open) = f.state() {
                        f.set_state(if open { FidState::AllocOpen } else { FidState::Alloc });
                    }
                }
                SeqResult::Nonseq
            }
            (op, body) => {
                return Err(Error::Protocol(format!(
                    "{:?} in reply to {:?}",
                    MsgType::from(&body),
                    op
                )));
            }
        };
        Ok(Some(r))
    }

    fn release(&self, st: &mut SeqState, file: Option<&Fid>) {
        if let Some(f) = file {
            st.fids.remove(&f.id());
            self.conn.putfid(f);
        }
    }

    /// Hand the sequence's fids back once both directions have ended.
    fn putfids(&self) {
        let (fids, failed) = {
            let mut st = self.lock();
            if !(st.do_eof && st.reply_eof) || st.fids.is_empty() {
                return;
            }
            (std::mem::take(&mut st.fids), st.err.is_some())
        };

        for (_, f) in fids {
            match f.state() {
                _ if failed => self.conn.putfid(&f),
                FidState::SeqAlloc(_, open) => {
                    f.set_state(if open { FidState::AllocOpen } else { FidState::Alloc })
                }
                FidState::SeqPending(_) => {
                    error!("sequence {}: fid {} never confirmed", self.id, f.id());
                    self.conn.putfid(&f);
                }
                _ => {}
            }
        }
    }
}
