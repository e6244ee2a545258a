//! A per-process namespace: a root and a current directory, with each
//! operation built as one pipelined sequence.

use {
    crate::{
        composite::{PathWalk, SeqOps, report, within},
        error::Error,
        fcall::*,
        fid::{Fid, FidState},
        fsys::access_omode,
        req::{BasicReq, Req, SeqResult},
        sequencer::Sequencer,
        serialize,
        stream::{self, ReadStream},
        utils::{Result, elements},
    },
    log::debug,
    std::sync::atomic::{AtomicU64, Ordering},
    tokio::sync::mpsc,
};

/// An open or walked file in a namespace.
#[derive(Debug)]
pub struct NsFile {
    f: Fid,
    offset: AtomicU64,
}

impl NsFile {
    pub fn new(f: Fid) -> NsFile {
        NsFile {
            f,
            offset: AtomicU64::new(0),
        }
    }

    pub fn fid(&self) -> &Fid {
        &self.f
    }

    pub fn qid(&self) -> Qid {
        self.f.qid()
    }

    pub fn is_dir(&self) -> bool {
        self.f.is_dir()
    }

    /// Walk `names` from this file in `seq`, yielding the new file.
    ///
    /// The file is usable once the tree has finished.
    pub async fn seq_walk(&self, seq: &Sequencer, names: Vec<String>) -> Result<NsFile> {
        let nf = self.f.conn().getfid()?;
        match seq.do_op(Some(&self.f), PathWalk::new(nf.clone(), names)).await {
            Ok(()) => Ok(NsFile::new(nf)),
            Err(e) => {
                if nf.state() == FidState::Free {
                    nf.conn().putfid(&nf);
                }
                Err(e)
            }
        }
    }

    /// Run `ops` on this file in a subsequence of `seq`.
    pub async fn seq_ops(&self, seq: &Sequencer, ops: Vec<Req>) -> Result<()> {
        seq.do_op(Some(&self.f), SeqOps { ops }).await
    }

    /// Start a streaming read of this file inside `seq`.
    pub async fn seq_read_stream(&self, seq: &Sequencer, nreqs: usize, iounit: usize) -> Result<ReadStream> {
        stream::read_stream(seq, &self.f, nreqs, iounit).await
    }

    /// Walk `path` relative to this file.
    pub async fn walk(&self, path: &str) -> Result<NsFile> {
        let (seq, _results) = Sequencer::new();
        let f = self.seq_walk(&seq, elements(path)).await;
        seq.end();
        seq.wait().await?;
        f
    }

    /// A second, independent fid for the same file.
    pub async fn clone(&self) -> Result<NsFile> {
        let nf = self.f.conn().getfid()?;
        if let Err(e) = self.f.do_op(BasicReq::Clone { newfid: nf.clone() }).await {
            nf.conn().putfid(&nf);
            return Err(e);
        }
        Ok(NsFile::new(nf))
    }

    pub async fn stat(&self) -> Result<Dir> {
        match self.f.do_op(BasicReq::Stat).await? {
            SeqResult::Stat(d) => Ok(d),
            r => Err(unexpected(&r)),
        }
    }

    pub async fn wstat(&self, dir: &Dir) -> Result<()> {
        self.f.do_op(BasicReq::Wstat { stat: dir.clone() }).await.map(|_| ())
    }

    pub async fn remove(self) -> Result<()> {
        self.f.do_op(BasicReq::Remove).await.map(|_| ())
    }

    pub async fn open(&self, mode: u8) -> Result<()> {
        if self.f.is_open() {
            return Err(Error::AlreadyOpen);
        }
        self.f.do_op(BasicReq::Open { mode }).await.map(|_| ())
    }

    /// Read at the file's own offset. `Ok(0)` means end of file.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.offset.load(Ordering::Acquire)).await?;
        self.offset.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    pub async fn read_at(&self, buf: &mut [u8], at: u64) -> Result<usize> {
        if !self.f.is_open() {
            return Err(Error::NotOpen);
        }
        let count = buf.len().min(self.f.iounit() as usize);
        let r = self
            .f
            .do_op(BasicReq::Read {
                buf: vec![0; count],
                offset: at,
            })
            .await?;
        match r {
            SeqResult::Read(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            r => Err(unexpected(&r)),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let n = self.write_at(data, self.offset.load(Ordering::Acquire)).await?;
        self.offset.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    pub async fn write_at(&self, data: &[u8], at: u64) -> Result<usize> {
        if !self.f.is_open() {
            return Err(Error::NotOpen);
        }
        match self
            .f
            .do_op(BasicReq::Write {
                data: data.to_vec(),
                offset: at,
            })
            .await?
        {
            SeqResult::Write(n) => Ok(n as usize),
            r => Err(unexpected(&r)),
        }
    }

    /// The next batch of directory entries; empty at the end of the directory.
    pub async fn dirread(&self) -> Result<Vec<Dir>> {
        if !self.is_dir() {
            return Err(Error::NotDir);
        }
        let mut buf = vec![0; STATMAX.min(self.f.iounit() as usize)];
        let n = self.read(&mut buf).await?;
        Ok(serialize::unpack_dirs(&buf[..n])?)
    }

    /// Stream the whole file with `nreqs` reads of `iounit` bytes in flight.
    pub async fn read_stream(&self, nreqs: usize, iounit: usize) -> Result<ReadStream> {
        let (seq, results) = Sequencer::new();
        let rs = match self.seq_read_stream(&seq, nreqs, iounit).await {
            Ok(rs) => rs,
            Err(e) => {
                seq.end();
                return Err(e);
            }
        };
        finish_after_stream(seq, results, &rs, None);
        Ok(rs)
    }

    pub async fn close(self) -> Result<()> {
        self.f.close().await
    }
}

fn unexpected(r: &SeqResult) -> Error {
    Error::Protocol(format!("unexpected result {:?}", r))
}

/// End `seq` once `rs` has issued its last read, clunking `clunk` first.
fn finish_after_stream(
    seq: Sequencer,
    mut results: mpsc::UnboundedReceiver<SeqResult>,
    rs: &ReadStream,
    clunk: Option<Fid>,
) {
    let mut issued = rs.issued_watch();
    tokio::spawn(async move {
        let _ = issued.wait_for(|d| *d).await;
        if let Some(f) = clunk {
            if let Err(e) = seq.do_op(Some(&f), BasicReq::Clunk).await {
                debug!("clunking streamed file: {}", e);
            }
        }
        seq.end();
        while results.recv().await.is_some() {}
        if let Err(e) = seq.wait().await {
            debug!("stream sequence: {}", e);
        }
    });
}

/// A namespace rooted at a file, with a current directory.
#[derive(Debug)]
pub struct Ns {
    root: NsFile,
    dot: NsFile,
}

impl Ns {
    /// A namespace whose root and current directory are both `root`.
    pub async fn new(root: Fid) -> Result<Ns> {
        let root = NsFile::new(root);
        let dot = root.clone().await?;
        Ok(Ns { root, dot })
    }

    pub fn root(&self) -> &NsFile {
        &self.root
    }

    pub fn dot(&self) -> &NsFile {
        &self.dot
    }

    /// The file `name` is relative to, and its elements.
    fn path(&self, name: &str) -> (&NsFile, Vec<String>) {
        let anchor = if name.starts_with('/') {
            &self.root
        } else {
            &self.dot
        };
        (anchor, elements(name))
    }

    pub async fn walk(&self, name: &str) -> Result<NsFile> {
        let (seq, _results) = Sequencer::new();
        let f = self.seq_walk(&seq, name).await;
        seq.end();
        seq.wait().await?;
        f
    }

    pub async fn seq_walk(&self, seq: &Sequencer, name: &str) -> Result<NsFile> {
        let (anchor, elems) = self.path(name);
        anchor.seq_walk(seq, elems).await
    }

    /// Walk to `name` and run `ops` on the result, in one subsequence.
    ///
    /// The subsequence's value is the [`SeqResult::Ops`] of `ops`.
    pub async fn seq_ops(&self, seq: &Sequencer, name: &str, ops: Vec<Req>) -> Result<NsFile> {
        let (anchor, elems) = self.path(name);
        let (sub, mut results) = seq.subsequencer("ns.seqops");

        let agg = sub.clone();
        tokio::spawn(async move {
            let _walk = results.recv().await;
            let ops = results.recv().await;
            while results.recv().await.is_some() {}
            report(&agg, ops.unwrap_or(SeqResult::Ops(Vec::new())));
        });

        let mut walked = None;
        let r = within(&sub, async {
            let f = anchor.seq_walk(&sub, elems).await?;
            let r = f.seq_ops(&sub, ops).await;
            walked = Some(f);
            r
        })
        .await;
        match (r, walked) {
            (Ok(()), Some(f)) => Ok(f),
            (Err(e), _) => Err(e),
            (Ok(()), None) => Err(Error::Aborted),
        }
    }

    /// Walk to `name` and run `ops` on it, waiting for the results.
    pub async fn ops(&self, name: &str, ops: Vec<Req>) -> Result<(NsFile, Vec<SeqResult>)> {
        let (seq, mut results) = Sequencer::new();
        let f = self.seq_ops(&seq, name, ops).await;
        seq.end();
        let r = results.recv().await;
        seq.wait().await?;
        let f = f?;
        match r {
            Some(SeqResult::Ops(rs)) => Ok((f, rs)),
            Some(r) => Err(unexpected(&r)),
            None => Err(Error::Aborted),
        }
    }

    pub async fn open(&self, name: &str, mode: u8) -> Result<NsFile> {
        let (f, _) = self.ops(name, vec![BasicReq::Open { mode }.into()]).await?;
        Ok(f)
    }

    pub async fn create(&self, name: &str, mode: u8, perm: u32) -> Result<NsFile> {
        let (seq, _results) = Sequencer::new();
        let f = self.seq_create(&seq, name, mode, perm).await;
        seq.end();
        seq.wait().await?;
        f
    }

    /// Create `name`, walking to its directory first, in one subsequence.
    pub async fn seq_create(&self, seq: &Sequencer, name: &str, mode: u8, perm: u32) -> Result<NsFile> {
        let (anchor, mut elems) = self.path(name);
        let Some(last) = elems.pop() else {
            return Err(Error::EmptyPath);
        };
        let (sub, mut results) = seq.subsequencer("ns.create");

        let agg = sub.clone();
        tokio::spawn(async move {
            let _walk = results.recv().await;
            let created = results.recv().await;
            while results.recv().await.is_some() {}
            report(&agg, created.unwrap_or(SeqResult::Ops(Vec::new())));
        });

        let mut walked = None;
        let r = within(&sub, async {
            let f = anchor.seq_walk(&sub, elems).await?;
            let create = BasicReq::Create {
                name: last,
                perm,
                mode,
            };
            let r = f.seq_ops(&sub, vec![create.into()]).await;
            walked = Some(f);
            r
        })
        .await;
        match (r, walked) {
            (Ok(()), Some(f)) => Ok(f),
            (Err(e), _) => Err(e),
            (Ok(()), None) => Err(Error::Aborted),
        }
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.ops(name, vec![BasicReq::Remove.into()]).await.map(|_| ())
    }

    pub async fn seq_remove(&self, seq: &Sequencer, name: &str) -> Result<()> {
        self.seq_ops(seq, name, vec![BasicReq::Remove.into()]).await.map(|_| ())
    }

    pub async fn stat(&self, name: &str) -> Result<Dir> {
        let (_, rs) = self
            .ops(name, vec![BasicReq::Stat.into(), BasicReq::Clunk.into()])
            .await?;
        match rs.into_iter().next() {
            Some(SeqResult::Stat(d)) => Ok(d),
            Some(r) => Err(unexpected(&r)),
            None => Err(Error::Aborted),
        }
    }

    pub async fn wstat(&self, name: &str, dir: &Dir) -> Result<()> {
        let ops = vec![
            BasicReq::Wstat { stat: dir.clone() }.into(),
            BasicReq::Clunk.into(),
        ];
        self.ops(name, ops).await.map(|_| ())
    }

    /// Check that `name` can be opened for `mode`, an `access` bit set.
    pub async fn access(&self, name: &str, mode: u8) -> Result<()> {
        if mode == access::EXIST {
            return self.stat(name).await.map(|_| ());
        }
        let omode = access_omode(mode)?;
        let ops = vec![BasicReq::Open { mode: omode }.into(), BasicReq::Clunk.into()];
        self.ops(name, ops).await.map(|_| ())
    }

    /// Change the current directory.
    pub async fn chdir(&mut self, name: &str) -> Result<()> {
        let f = self.walk(name).await?;
        if !f.is_dir() {
            if let Err(e) = f.close().await {
                debug!("closing non-directory: {}", e);
            }
            return Err(Error::NotDir);
        }
        let old = std::mem::replace(&mut self.dot, f);
        old.close().await
    }

    /// Stream the file `name`: walk, open, read with `nreqs` reads of
    /// `iounit` bytes in flight, then clunk, all in one sequence.
    pub async fn read_stream(&self, name: &str, nreqs: usize, iounit: usize) -> Result<ReadStream> {
        let (seq, results) = Sequencer::new();
        let f = match self.seq_walk(&seq, name).await {
            Ok(f) => f,
            Err(e) => {
                seq.end();
                return Err(e);
            }
        };
        let opened = seq
            .do_op(Some(f.fid()), BasicReq::Open { mode: om::READ })
            .await;
        let rs = match opened {
            Ok(()) => f.seq_read_stream(&seq, nreqs, iounit).await,
            Err(e) => Err(e),
        };
        match rs {
            Ok(rs) => {
                finish_after_stream(seq, results, &rs, Some(f.fid().clone()));
                Ok(rs)
            }
            Err(e) => {
                seq.end();
                Err(e)
            }
        }
    }
}
