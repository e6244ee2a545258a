//! Client side fids and their single-request operations.

use {
    crate::{
        conn::Conn,
        error::Error,
        fcall::*,
        req::{BasicReq, SeqResult},
        serialize,
        utils::Result,
    },
    log::debug,
    std::{
        fmt,
        io::SeekFrom,
        sync::{Arc, Mutex, MutexGuard, Weak},
    },
};

/// Lifecycle of a fid.
///
/// `Seq*` states carry the id of the sequence that owns the fid; while a
/// sequence owns a fid no single request may use it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FidState {
    /// Allocated locally, nothing on the server yet.
    Free,
    /// A request that creates the fid is in flight.
    Pending,
    Alloc,
    AllocOpen,
    /// Cloned inside a sequence; the clone reply has not arrived yet.
    SeqPending(u64),
    /// Created inside a sequence; the flag records whether it is open.
    SeqAlloc(u64, bool),
    Clunked,
}

impl FidState {
    pub fn is_open(&self) -> bool {
        matches!(self, FidState::AllocOpen | FidState::SeqAlloc(_, true))
    }
}

pub(crate) struct FidData {
    qid: Qid,
    mode: u8,
    state: FidState,
    offset: u64,
    iounit: u32,
}

pub(crate) struct FidInner {
    id: u32,
    conn: Conn,
    data: Mutex<FidData>,
}

/// A handle on a server side file reference.
///
/// Clones share the same fid.
#[derive(Clone)]
pub struct Fid(Arc<FidInner>);

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.data();
        f.debug_struct("Fid")
            .field("id", &self.0.id)
            .field("state", &d.state)
            .field("qid", &d.qid)
            .finish()
    }
}

impl Fid {
    pub(crate) fn new(conn: Conn, id: u32) -> Fid {
        Fid(Arc::new(FidInner {
            id,
            conn,
            data: Mutex::new(FidData {
                qid: Qid::default(),
                mode: 0,
                state: FidState::Free,
                offset: 0,
                iounit: 0,
            }),
        }))
    }

    pub(crate) fn downgrade(&self) -> Weak<FidInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(w: &Weak<FidInner>) -> Option<Fid> {
        w.upgrade().map(Fid)
    }

    fn data(&self) -> MutexGuard<'_, FidData> {
        self.0.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub fn conn(&self) -> &Conn {
        &self.0.conn
    }

    pub fn qid(&self) -> Qid {
        self.data().qid
    }

    pub fn mode(&self) -> u8 {
        self.data().mode
    }

    pub fn state(&self) -> FidState {
        self.data().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn is_dir(&self) -> bool {
        self.qid().is_dir()
    }

    /// Cached offset used by reads and writes without an explicit offset.
    pub fn offset(&self) -> u64 {
        self.data().offset
    }

    /// Largest payload of one read or write on this fid.
    pub fn iounit(&self) -> u32 {
        let max = self.0.conn.iounit();
        match self.data().iounit {
            0 => max,
            n => n.min(max),
        }
    }

    pub(crate) fn set_state(&self, state: FidState) {
        self.data().state = state;
    }

    pub(crate) fn set_qid(&self, qid: Qid) {
        self.data().qid = qid;
    }

    /// Record a successful open or create.
    pub(crate) fn set_open(&self, qid: Qid, mode: u8, iounit: u32) {
        let mut d = self.data();
        d.qid = qid;
        d.mode = mode;
        d.iounit = iounit;
        d.state = match d.state {
            FidState::SeqAlloc(s, _) | FidState::SeqPending(s) => FidState::SeqAlloc(s, true),
            _ => FidState::AllocOpen,
        };
    }

    /// Make `self` a copy of `src` as a walk with no names does.
    pub(crate) fn copy_from(&self, src: &Fid, state: FidState) {
        let (qid, offset) = {
            let s = src.data();
            (s.qid, s.offset)
        };
        let mut d = self.data();
        d.qid = qid;
        d.offset = offset;
        d.mode = 0;
        d.iounit = 0;
        d.state = state;
    }

    /// Fail unless the fid may be used by a single request.
    fn check_idle(&self) -> Result<()> {
        match self.state() {
            FidState::Alloc | FidState::AllocOpen => Ok(()),
            FidState::Pending | FidState::SeqPending(_) | FidState::SeqAlloc(..) => {
                Err(Error::FidBusy)
            }
            FidState::Free | FidState::Clunked => Err(Error::BadFid),
        }
    }

    fn check_open(&self) -> Result<()> {
        self.check_idle()?;
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    /// Walk to `names`, returning a new fid.
    ///
    /// Names are sent at most `MAXWELEM` per message. With no names the result
    /// is a clone of this fid. Walking less than the whole path is an error and
    /// leaves no new fid behind.
    pub async fn walk<S: AsRef<str>>(&self, names: &[S]) -> Result<Fid> {
        self.check_idle()?;
        let conn = self.conn();
        let wfid = conn.getfid()?;
        wfid.set_state(FidState::Pending);

        if names.is_empty() {
            let reply = conn
                .rpc(FCall::TWalk {
                    fid: self.id(),
                    newfid: wfid.id(),
                    wnames: Vec::new(),
                })
                .await;
            return match reply {
                Ok(_) => {
                    wfid.copy_from(self, FidState::Alloc);
                    Ok(wfid)
                }
                Err(e) => {
                    conn.putfid(&wfid);
                    Err(e)
                }
            };
        }

        let mut walked = 0;
        let mut qid = self.qid();
        for chunk in names.chunks(MAXWELEM) {
            let wnames: Vec<String> = chunk.iter().map(|s| s.as_ref().to_owned()).collect();
            let fid = if walked == 0 { self.id() } else { wfid.id() };
            let reply = conn
                .rpc(FCall::TWalk {
                    fid,
                    newfid: wfid.id(),
                    wnames,
                })
                .await;

            let wqids = match reply {
                Ok(FCall::RWalk { wqids }) => wqids,
                Ok(other) => {
                    let e = self.unexpected(&other);
                    self.abandon_walk(&wfid, walked).await;
                    return Err(e);
                }
                Err(e) => {
                    self.abandon_walk(&wfid, walked).await;
                    return Err(e);
                }
            };

            if wqids.len() > chunk.len() {
                let e = self.conn().protocol_error(format!(
                    "walk of {} names returned {} qids",
                    chunk.len(),
                    wqids.len()
                ));
                self.abandon_walk(&wfid, walked).await;
                return Err(e);
            }
            if wqids.len() < chunk.len() {
                self.abandon_walk(&wfid, walked).await;
                let upto = walked + wqids.len() + 1;
                let path: Vec<&str> = names[..upto].iter().map(AsRef::as_ref).collect();
                return Err(Error::NotFound(path.join("/")));
            }

            if walked == 0 {
                wfid.set_state(FidState::Alloc);
            }
            walked += wqids.len();
            if let Some(q) = wqids.last() {
                qid = *q;
            }
        }

        wfid.set_qid(qid);
        Ok(wfid)
    }

    /// Clean up after a failed walk. The server only holds the new fid if an
    /// earlier chunk succeeded.
    async fn abandon_walk(&self, wfid: &Fid, walked: usize) {
        if walked == 0 {
            self.conn().putfid(wfid);
        } else if let Err(e) = wfid.close().await {
            debug!("clunk after failed walk: {}", e);
        }
    }

    /// Walk this fid in place by one name.
    async fn walk1(&self, name: &str) -> Result<Qid> {
        let reply = self
            .conn()
            .rpc(FCall::TWalk {
                fid: self.id(),
                newfid: self.id(),
                wnames: vec![name.to_owned()],
            })
            .await?;
        match reply {
            FCall::RWalk { wqids } if wqids.len() == 1 => {
                self.set_qid(wqids[0]);
                Ok(wqids[0])
            }
            FCall::RWalk { wqids } => Err(self.conn().protocol_error(format!(
                "walk of {:?} returned {} qids",
                name,
                wqids.len()
            ))),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Make the `Free` fid `newfid` refer to the same file as this one.
    pub async fn clone_to(&self, newfid: &Fid) -> Result<()> {
        self.check_idle()?;
        if newfid.state() != FidState::Free || newfid.conn().key() != self.conn().key() {
            return Err(Error::FidInUse);
        }
        newfid.set_state(FidState::Pending);
        let reply = self
            .conn()
            .rpc(FCall::TWalk {
                fid: self.id(),
                newfid: newfid.id(),
                wnames: Vec::new(),
            })
            .await;
        match reply {
            Ok(_) => {
                newfid.copy_from(self, FidState::Alloc);
                Ok(())
            }
            Err(e) => {
                newfid.set_state(FidState::Free);
                Err(e)
            }
        }
    }

    pub async fn open(&self, mode: u8) -> Result<()> {
        self.check_idle()?;
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }
        match self.conn().rpc(FCall::TOpen { fid: self.id(), mode }).await? {
            FCall::ROpen { qid, iounit } => {
                self.set_open(qid, mode, iounit);
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        }
    }

    /// Create `name` in the directory this fid refers to. On success the fid
    /// refers to the new file, opened with `mode`.
    pub async fn create(&self, name: &str, perm: u32, mode: u8) -> Result<()> {
        self.check_idle()?;
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }
        let call = FCall::TCreate {
            fid: self.id(),
            name: name.to_owned(),
            perm,
            mode,
        };
        match self.conn().rpc(call).await? {
            FCall::RCreate { qid, iounit } => {
                self.set_open(qid, mode, iounit);
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        }
    }

    /// Read at the cached offset and advance it. `Ok(0)` means end of file.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(buf, None).await
    }

    /// Read at `offset` without touching the cached offset.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_inner(buf, Some(offset)).await
    }

    async fn read_inner(&self, buf: &mut [u8], at: Option<u64>) -> Result<usize> {
        self.check_open()?;
        let count = buf.len().min(self.iounit() as usize);
        let offset = at.unwrap_or_else(|| self.offset());

        let reply = self
            .conn()
            .rpc(FCall::TRead {
                fid: self.id(),
                offset,
                count: count as u32,
            })
            .await?;
        let data = match reply {
            FCall::RRead { data } => data.0,
            other => return Err(self.unexpected(&other)),
        };
        if data.len() > count {
            return Err(self.conn().protocol_error(format!(
                "read of {} bytes returned {}",
                count,
                data.len()
            )));
        }

        buf[..data.len()].copy_from_slice(&data);
        if at.is_none() {
            self.data().offset += data.len() as u64;
        }
        Ok(data.len())
    }

    /// Fill `buf` completely, failing with `UnexpectedEof` if the file ends first.
    pub async fn read_full(&self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.read(&mut buf[done..]).await? {
                0 => {
                    return Err(io_err_eof(done, buf.len()));
                }
                n => done += n,
            }
        }
        Ok(())
    }

    /// Write at the cached offset and advance it.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_inner(data, None).await
    }

    pub async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.write_inner(data, Some(offset)).await
    }

    async fn write_inner(&self, data: &[u8], at: Option<u64>) -> Result<usize> {
        self.check_open()?;
        let iounit = self.iounit() as usize;
        let mut offset = at.unwrap_or_else(|| self.offset());
        let mut total = 0;

        // An empty write still goes to the server once.
        loop {
            let want = (data.len() - total).min(iounit);
            let reply = self
                .conn()
                .rpc(FCall::TWrite {
                    fid: self.id(),
                    offset,
                    data: Data(data[total..total + want].to_vec()),
                })
                .await?;
            let got = match reply {
                FCall::RWrite { count } => count as usize,
                other => return Err(self.unexpected(&other)),
            };
            if got > want {
                return Err(self.conn().protocol_error(format!(
                    "write of {} bytes acknowledged {}",
                    want, got
                )));
            }

            total += got;
            offset += got as u64;
            if at.is_none() {
                self.data().offset = offset;
            }
            if total == data.len() || got == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Move the cached offset. Seeking from the end needs a `stat`.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let base = match pos {
            SeekFrom::Start(n) => {
                self.data().offset = n;
                return Ok(n);
            }
            SeekFrom::Current(d) => (self.offset(), d),
            SeekFrom::End(d) => (self.stat().await?.length, d),
        };
        let off = base
            .0
            .checked_add_signed(base.1)
            .ok_or_else(|| Error::InvalidInput(format!("seek by {} from {} is out of range", base.1, base.0)))?;
        self.data().offset = off;
        Ok(off)
    }

    pub async fn stat(&self) -> Result<Dir> {
        self.check_idle()?;
        match self.conn().rpc(FCall::TStat { fid: self.id() }).await? {
            FCall::RStat { stat } => Ok(stat),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn wstat(&self, stat: &Dir) -> Result<()> {
        self.check_idle()?;
        self.conn()
            .rpc(FCall::TWStat {
                fid: self.id(),
                stat: stat.clone(),
            })
            .await
            .map(|_| ())
    }

    /// Read the next batch of directory entries. An empty batch means the
    /// directory has been read completely.
    pub async fn dirread(&self) -> Result<Vec<Dir>> {
        let mut buf = vec![0; STATMAX.min(self.iounit() as usize)];
        let n = self.read(&mut buf).await?;
        Ok(serialize::unpack_dirs(&buf[..n])?)
    }

    /// Read every remaining directory entry.
    pub async fn dirreadall(&self) -> Result<Vec<Dir>> {
        let mut dirs = Vec::new();
        loop {
            let batch = self.dirread().await?;
            if batch.is_empty() {
                return Ok(dirs);
            }
            dirs.extend(batch);
        }
    }

    /// Remove the file. The fid is released whether or not the server agrees.
    pub async fn remove(&self) -> Result<()> {
        self.check_idle()?;
        let r = self.conn().rpc(FCall::TRemove { fid: self.id() }).await;
        self.conn().putfid(self);
        r.map(|_| ())
    }

    /// Clunk the fid. A fid that never reached the server is released silently.
    pub async fn close(&self) -> Result<()> {
        match self.state() {
            FidState::Clunked => return Ok(()),
            FidState::Free => {
                self.conn().putfid(self);
                return Ok(());
            }
            _ => self.check_idle()?,
        }
        let r = self.conn().rpc(FCall::TClunk { fid: self.id() }).await;
        self.conn().putfid(self);
        r.map(|_| ())
    }

    fn unexpected(&self, body: &FCall) -> Error {
        self.conn()
            .protocol_error(format!("unexpected reply {:?}", MsgType::from(body)))
    }

    /// Run one sequence operation as an ordinary request on this fid.
    pub async fn do_op(&self, op: BasicReq) -> Result<SeqResult> {
        match op {
            BasicReq::Clone { newfid } => self.clone_to(&newfid).await.map(|_| SeqResult::Clone),
            BasicReq::Create { name, perm, mode } => {
                self.create(&name, perm, mode).await?;
                Ok(SeqResult::Create(self.qid()))
            }
            BasicReq::Walk { name } => {
                self.check_idle()?;
                self.walk1(&name).await.map(SeqResult::Walk)
            }
            BasicReq::Open { mode } => {
                self.open(mode).await?;
                Ok(SeqResult::Open(self.qid()))
            }
            BasicReq::Read { mut buf, offset } => {
                let n = self.read_at(&mut buf, offset).await?;
                buf.truncate(n);
                Ok(SeqResult::Read(buf))
            }
            BasicReq::Write { data, offset } => {
                let n = self.write_at(&data, offset).await?;
                Ok(SeqResult::Write(n as u32))
            }
            BasicReq::Stat => self.stat().await.map(SeqResult::Stat),
            BasicReq::Wstat { stat } => self.wstat(&stat).await.map(|_| SeqResult::Wstat),
            BasicReq::Remove => self.remove().await.map(|_| SeqResult::Remove),
            BasicReq::Clunk => self.close().await.map(|_| SeqResult::Clunk),
            other => Err(Error::InvalidInput(format!(
                "{:?} only makes sense inside a sequence",
                other
            ))),
        }
    }
}


fn io_err_eof(got: usize, want: usize) -> Error {
    crate::io_err!(UnexpectedEof, format!("read {} of {} bytes", got, want)).into()
}
