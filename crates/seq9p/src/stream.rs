//! Streaming reads with several requests in flight.
//!
//! A stream keeps up to `nreqs` reads of `iounit` bytes outstanding in a
//! subsequence of its own, and hands the data over in file order. A read
//! returning no data, or less than was asked for, ends the stream. For a file
//! of `size` bytes at most `⌈size/iounit⌉ + nreqs - 1` reads go on the wire
//! when `nreqs` is above one.

use {
    crate::{
        error::Error,
        fid::Fid,
        queue::SyncQueue,
        req::{BasicReq, CompositeReq, Req, SeqResult},
        sequencer::Sequencer,
        utils::Result,
    },
    async_trait::async_trait,
    log::{debug, warn},
    std::sync::Arc,
    tokio::{
        io::{AsyncWrite, AsyncWriteExt},
        sync::{mpsc, watch},
    },
    tokio_util::sync::CancellationToken,
};

#[derive(Debug)]
enum Chunk {
    Data(Vec<u8>),
    End(Option<Error>),
}

/// The consuming end of a streaming read.
#[derive(Debug)]
pub struct ReadStream {
    chunks: mpsc::Receiver<Chunk>,
    acks: Option<mpsc::Sender<Vec<u8>>>,
    cur: Option<(Vec<u8>, usize)>,
    done: bool,
    issued: watch::Receiver<bool>,
}

/// Start a streaming read of `file` from offset zero inside `seq`.
///
/// The stream's subsequence stays open until the stream reaches its end or is
/// closed; nothing else may be submitted to the tree until
/// [`ReadStream::issued`] completes.
pub async fn read_stream(seq: &Sequencer, file: &Fid, nreqs: usize, iounit: usize) -> Result<ReadStream> {
    if nreqs == 0 || iounit == 0 {
        return Err(Error::InvalidInput(format!(
            "stream needs requests and a buffer size, got {} x {}",
            nreqs, iounit
        )));
    }
    let max = file.conn().iounit() as usize;
    if iounit > max {
        return Err(Error::InvalidInput(format!(
            "stream buffer of {} bytes exceeds iounit {}",
            iounit, max
        )));
    }

    let (chunks_tx, chunks_rx) = mpsc::channel(1);
    let (acks_tx, acks_rx) = mpsc::channel(1);
    let (issued_tx, issued_rx) = watch::channel(false);

    let req = StreamReq {
        nreqs,
        iounit,
        chunks: chunks_tx,
        acks: acks_rx,
        issued: issued_tx,
    };
    seq.do_op(Some(file), Req::composite(req)).await?;

    Ok(ReadStream {
        chunks: chunks_rx,
        acks: Some(acks_tx),
        cur: None,
        done: false,
        issued: issued_rx,
    })
}

impl ReadStream {
    /// Read the next bytes of the stream. `Ok(0)` means the stream has ended.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some((data, pos)) = &mut self.cur {
                let n = (data.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                if *pos == data.len() {
                    if let Some((data, _)) = self.cur.take() {
                        self.ack(data).await;
                    }
                }
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            match self.chunks.recv().await {
                Some(Chunk::Data(d)) => self.cur = Some((d, 0)),
                Some(Chunk::End(None)) | None => {
                    self.done = true;
                    return Ok(0);
                }
                Some(Chunk::End(Some(e))) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
    }

    /// Hand a drained buffer back so another read can be issued with it.
    async fn ack(&mut self, buf: Vec<u8>) {
        if let Some(acks) = &self.acks {
            if acks.send(buf).await.is_err() {
                self.acks = None;
            }
        }
    }

    /// Copy the rest of the stream into `w`.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<u64> {
        let mut buf = vec![0; 8192];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                w.flush().await?;
                return Ok(total);
            }
            w.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Stop reading. Requests already in flight are drained in the background.
    pub fn close(&mut self) {
        self.acks = None;
        self.cur = None;
        self.done = true;
        self.chunks.close();
    }

    /// Wait until the stream has submitted its last read and ended its subsequence.
    pub async fn issued(&self) {
        let mut rx = self.issued.clone();
        let _ = rx.wait_for(|d| *d).await;
    }

    pub(crate) fn issued_watch(&self) -> watch::Receiver<bool> {
        self.issued.clone()
    }
}

#[derive(Debug)]
struct StreamReq {
    nreqs: usize,
    iounit: usize,
    chunks: mpsc::Sender<Chunk>,
    acks: mpsc::Receiver<Vec<u8>>,
    issued: watch::Sender<bool>,
}

#[async_trait]
impl CompositeReq for StreamReq {
    async fn run(self: Box<Self>, seq: &Sequencer, file: Option<&Fid>) -> Result<()> {
        let file = file
            .cloned()
            .ok_or_else(|| Error::InvalidInput("stream needs a file".to_owned()))?;
        let StreamReq {
            nreqs,
            iounit,
            chunks,
            acks,
            issued,
        } = *self;

        let (sub, results) = seq.subsequencer("stream reader");
        let (bufs_tx, bufs_rx) = mpsc::channel(nreqs);
        for _ in 0..nreqs {
            if bufs_tx.try_send(vec![0; iounit]).is_err() {
                break;
            }
        }
        let pending = Arc::new(SyncQueue::new());
        let cancel = CancellationToken::new();

        let deliverer = Deliverer {
            sub: sub.clone(),
            pending: pending.clone(),
            bufs: bufs_tx,
            cancel: cancel.clone(),
            chunks,
            acks,
            issued: issued.subscribe(),
            iounit,
            nreqs,
        };
        tokio::spawn(deliverer.run(results));
        tokio::spawn(issue(sub, file, bufs_rx, pending, cancel, issued));
        Ok(())
    }
}

/// Submit a read for every free buffer until cancelled.
async fn issue(
    sub: Sequencer,
    file: Fid,
    mut bufs: mpsc::Receiver<Vec<u8>>,
    pending: Arc<SyncQueue<usize>>,
    cancel: CancellationToken,
    issued: watch::Sender<bool>,
) {
    let mut offset = 0u64;
    loop {
        let buf = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            b = bufs.recv() => match b {
                Some(b) => b,
                None => break,
            },
        };
        let n = buf.len();
        pending.put(n);
        if let Err(e) = sub.do_op(Some(&file), BasicReq::Read { buf, offset }).await {
            debug!("stream reader stopped issuing: {}", e);
            break;
        }
        offset += n as u64;
    }
    sub.end();
    let _ = issued.send(true);
}

struct Deliverer {
    sub: Sequencer,
    pending: Arc<SyncQueue<usize>>,
    bufs: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    chunks: mpsc::Sender<Chunk>,
    acks: mpsc::Receiver<Vec<u8>>,
    issued: watch::Receiver<bool>,
    iounit: usize,
    nreqs: usize,
}

impl Deliverer {
    async fn run(mut self, mut results: mpsc::UnboundedReceiver<SeqResult>) {
        let mut reader_gone = false;
        // A consumed buffer is reissued only once the read after it has come
        // back full, so no read is issued past a reply that ends the file.
        let mut held = None;
        while let Some(r) = results.recv().await {
            let want = self.pending.get().unwrap_or(0);
            let SeqResult::Read(buf) = r else {
                warn!("stream reader: unexpected result {:?}", r);
                continue;
            };
            let n = buf.len();
            if n == 0 {
                break;
            }
            if n == want {
                if let Some(b) = held.take() {
                    self.reissue(b).await;
                }
            }
            if self.chunks.send(Chunk::Data(buf)).await.is_err() {
                reader_gone = true;
                break;
            }
            match self.acks.recv().await {
                Some(_) if n < want => break,
                // With a single buffer nothing else is in flight to wait for.
                Some(buf) if self.nreqs == 1 => self.reissue(buf).await,
                Some(buf) => held = Some(buf),
                None => {
                    reader_gone = true;
                    break;
                }
            }
        }

        self.cancel.cancel();
        while results.recv().await.is_some() {}
        let _ = self.issued.wait_for(|d| *d).await;

        let err = self.sub.error().map(|e| match e {
            Error::Aborted => self.sub.cause().unwrap_or(Error::Aborted),
            e => e,
        });
        if !reader_gone {
            let _ = self.chunks.send(Chunk::End(err.clone())).await;
        }
        self.sub.result(match err {
            Some(e) => Err(e),
            None => Ok(SeqResult::Str("read stream".to_owned())),
        });
    }

    async fn reissue(&self, mut buf: Vec<u8>) {
        buf.resize(self.iounit, 0);
        let _ = self.bufs.send(buf).await;
    }
}
