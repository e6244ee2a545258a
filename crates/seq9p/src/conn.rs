//! Connection multiplexer.
//!
//! A [`Conn`] owns one transport. Requests from many tasks share it; replies are
//! routed back to their senders by tag. A reader task demultiplexes replies, and
//! writes are serialised by a lock on the framed writer.
//!
//! Any transport failure is sticky: every waiter is woken with the error, live
//! fids are marked clunked and later calls return the same error.

use {
    crate::{
        error::Error,
        fcall::*,
        fid::{Fid, FidInner, FidState},
        io_err, serialize,
        utils::Result,
    },
    bytes::{
        Bytes,
        buf::{Buf, BufMut},
    },
    futures::sink::SinkExt,
    log::{debug, error, warn},
    std::{
        collections::{HashMap, HashSet},
        fmt,
        sync::{Arc, Mutex, MutexGuard, Weak},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::{mpsc, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{
        FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec,
    },
};

/// Default maximum message size offered in `Tversion`.
pub const DEFAULT_MSIZE: u32 = 65536;

/// Parameters of the version handshake.
#[derive(Clone, Debug)]
pub struct ConnConfig {
    pub msize: u32,
    pub version: String,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            msize: DEFAULT_MSIZE,
            version: P92000.to_owned(),
        }
    }
}

impl ConnConfig {
    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) type Writer = FramedWrite<BoxedWriter, LengthDelimitedCodec>;
pub(crate) type WriterGuard<'a> = AsyncMutexGuard<'a, Writer>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_codec()
}

struct Shared {
    tagmap: HashMap<u16, mpsc::UnboundedSender<Msg>>,
    freetags: HashSet<u16>,
    nexttag: u16,
    fids: HashMap<u32, Weak<FidInner>>,
    freefids: HashSet<u32>,
    nextfid: u32,
    err: Option<Error>,
}

pub(crate) struct ConnInner {
    writer: AsyncMutex<Writer>,
    shared: Mutex<Shared>,
    msize: u32,
    version: String,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = reader.take() {
            h.abort();
        }
    }
}

/// A multiplexed client connection.
///
/// Cloning is cheap and yields another handle to the same connection.
#[derive(Clone)]
pub struct Conn(Arc<ConnInner>);

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("msize", &self.0.msize)
            .field("version", &self.0.version)
            .finish()
    }
}

impl Conn {
    /// Negotiate a version over `reader`/`writer` and start demultiplexing replies.
    pub async fn new<R, W>(reader: R, writer: W, config: ConnConfig) -> Result<Conn>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut framedread = FramedRead::new(Box::new(reader) as BoxedReader, codec());
        let mut framedwrite = FramedWrite::new(Box::new(writer) as BoxedWriter, codec());

        let (msize, version) = handshake(&mut framedread, &mut framedwrite, &config).await?;
        debug!("negotiated {} with msize {}", version, msize);

        let inner = Arc::new(ConnInner {
            writer: AsyncMutex::new(framedwrite),
            shared: Mutex::new(Shared {
                tagmap: HashMap::new(),
                freetags: HashSet::new(),
                nexttag: 1,
                fids: HashMap::new(),
                freefids: HashSet::new(),
                nextfid: 1,
                err: None,
            }),
            msize,
            version,
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(Arc::downgrade(&inner), framedread));
        *lock(&inner.reader) = Some(handle);

        Ok(Conn(inner))
    }

    /// Like [`Conn::new`], for a single bidirectional stream.
    pub async fn from_stream<S>(stream: S, config: ConnConfig) -> Result<Conn>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Conn::new(reader, writer, config).await
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.0.msize
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> &str {
        &self.0.version
    }

    /// Largest payload of a single read or write.
    pub fn iounit(&self) -> u32 {
        self.0.msize - IOHDRSZ
    }

    /// The sticky error, if the connection has failed.
    pub fn error(&self) -> Option<Error> {
        self.shared().err.clone()
    }

    /// Identity of the underlying connection, shared by all clones of this handle.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Shut the transport down. Outstanding and later requests fail with `Hungup`.
    pub async fn close(&self) {
        {
            let mut w = self.0.writer.lock().await;
            if let Err(e) = SinkExt::<Bytes>::close(&mut *w).await {
                debug!("closing transport: {}", e);
            }
        }
        self.fail(Error::Hungup);
    }

    /// Send one request and wait for its reply.
    ///
    /// `Rerror` becomes [`Error::Server`]; any other reply type than the one
    /// matching the request is a protocol error, which fails the connection.
    pub async fn rpc(&self, body: FCall) -> Result<FCall> {
        let expect = MsgType::from(&body).reply();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = self.newtag(tx)?;

        let msg = Msg { tag, body };
        if let Err(e) = self.write(&msg).await {
            self.puttag(tag);
            return Err(e);
        }

        let reply = rx.recv().await;
        self.puttag(tag);

        let reply = reply.ok_or_else(|| self.error().unwrap_or(Error::Hungup))?;
        match reply.body {
            FCall::RError { ename } => Err(Error::Server(ename)),
            body if Some(MsgType::from(&body)) == expect => Ok(body),
            body => Err(self.protocol_error(format!(
                "expected {:?}, got {:?}",
                expect,
                MsgType::from(&body)
            ))),
        }
    }

    pub(crate) async fn lock_writer(&self) -> WriterGuard<'_> {
        self.0.writer.lock().await
    }

    pub(crate) async fn write(&self, msg: &Msg) -> Result<()> {
        let mut w = self.lock_writer().await;
        self.write_with(&mut w, msg).await
    }

    /// Write `msg` while the caller already holds the writer.
    pub(crate) async fn write_with(&self, w: &mut WriterGuard<'_>, msg: &Msg) -> Result<()> {
        let frame = self.encode(msg)?;
        self.write_frame(w, frame).await?;
        debug!("\t→ {:?}", msg);
        Ok(())
    }

    /// Pack `msg` into one frame body, refusing messages larger than msize.
    pub(crate) fn encode(&self, msg: &Msg) -> Result<Bytes> {
        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, msg)?;
        let frame = writer.into_inner().freeze();
        if frame.len() + 4 > self.0.msize as usize {
            return Err(Error::InvalidInput(format!(
                "message of {} bytes exceeds msize {}",
                frame.len() + 4,
                self.0.msize
            )));
        }
        Ok(frame)
    }

    /// Send a frame made by [`Conn::encode`]. A transport error fails the connection.
    pub(crate) async fn write_frame(&self, w: &mut WriterGuard<'_>, frame: Bytes) -> Result<()> {
        if let Some(e) = self.error() {
            return Err(e);
        }
        if let Err(e) = w.send(frame).await {
            let e = Error::from(e);
            error!("write failed: {}", e);
            self.fail(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Reserve a tag whose replies are delivered to `tx`.
    pub(crate) fn newtag(&self, tx: mpsc::UnboundedSender<Msg>) -> Result<u16> {
        let mut s = self.shared();
        if let Some(e) = &s.err {
            return Err(e.clone());
        }

        let tag = if let Some(&t) = s.freetags.iter().next() {
            s.freetags.remove(&t);
            t
        } else if s.nexttag != NOTAG {
            let t = s.nexttag;
            s.nexttag += 1;
            t
        } else {
            return Err(Error::OutOfTags);
        };
        s.tagmap.insert(tag, tx);
        Ok(tag)
    }

    pub(crate) fn puttag(&self, tag: u16) {
        let mut s = self.shared();
        if s.tagmap.remove(&tag).is_some() {
            s.freetags.insert(tag);
        }
    }

    /// Allocate a fid in the `Free` state, to be the target of a clone.
    ///
    /// Closing a fid that is still `Free` only releases the id.
    pub fn getfid(&self) -> Result<Fid> {
        let mut s = self.shared();
        if let Some(e) = &s.err {
            return Err(e.clone());
        }

        let id = if s.nextfid != NOFID {
            let id = s.nextfid;
            s.nextfid += 1;
            id
        } else if let Some(&id) = s.freefids.iter().next() {
            s.freefids.remove(&id);
            id
        } else {
            return Err(Error::OutOfFids);
        };

        let fid = Fid::new(self.clone(), id);
        s.fids.insert(id, fid.downgrade());
        Ok(fid)
    }

    /// Forget `fid` locally. It no longer refers to anything on the server.
    pub(crate) fn putfid(&self, fid: &Fid) {
        {
            let mut s = self.shared();
            if s.fids.remove(&fid.id()).is_some() {
                s.freefids.insert(fid.id());
            }
        }
        fid.set_state(FidState::Clunked);
    }

    /// Fail the connection with a protocol violation and return the error.
    pub(crate) fn protocol_error(&self, msg: impl Into<String>) -> Error {
        let e = Error::Protocol(msg.into());
        error!("{}", e);
        self.fail(e.clone());
        e
    }

    /// Record `err` as the connection's sticky error and wake every waiter.
    pub(crate) fn fail(&self, err: Error) {
        let fids: Vec<Fid> = {
            let mut s = self.shared();
            if s.err.is_none() {
                s.err = Some(err);
            }
            // Dropping the senders wakes everything blocked on a reply.
            s.tagmap.clear();
            s.fids
                .drain()
                .filter_map(|(_, w)| Fid::upgrade(&w))
                .collect()
        };
        for f in fids {
            f.set_state(FidState::Clunked);
        }
        if let Some(h) = lock(&self.0.reader).take() {
            h.abort();
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.0.shared)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn handshake(
    framedread: &mut FramedRead<BoxedReader, LengthDelimitedCodec>,
    framedwrite: &mut Writer,
    config: &ConnConfig,
) -> Result<(u32, String)> {
    let msg = Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize: config.msize,
            version: config.version.clone(),
        },
    };
    let mut writer = bytes::BytesMut::with_capacity(64).writer();
    serialize::write_msg(&mut writer, &msg)?;
    framedwrite.send(writer.into_inner().freeze()).await?;
    debug!("\t→ {:?}", msg);

    let bytes = match framedread.next().await {
        Some(bytes) => bytes?,
        None => return Err(io_err!(UnexpectedEof, "connection closed during version").into()),
    };
    let reply = serialize::read_msg(&mut bytes.reader())?;
    debug!("\t← {:?}", reply);

    match reply.body {
        FCall::RVersion { msize, version } => {
            if msize > config.msize {
                return Err(Error::Protocol(format!(
                    "server msize {} larger than offered {}",
                    msize, config.msize
                )));
            }
            if msize <= IOHDRSZ {
                return Err(Error::Protocol(format!("server msize {} too small", msize)));
            }
            if version != P92000 {
                return Err(Error::Protocol(format!("unsupported version {:?}", version)));
            }
            Ok((msize, version))
        }
        FCall::RError { ename } => Err(Error::Server(ename)),
        body => Err(Error::Protocol(format!(
            "expected RVersion, got {:?}",
            MsgType::from(&body)
        ))),
    }
}

async fn read_loop(inner: Weak<ConnInner>, mut framedread: FramedRead<BoxedReader, LengthDelimitedCodec>) {
    let err = loop {
        let bytes = match framedread.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => break Error::from(e),
            None => break io_err!(UnexpectedEof, "connection closed by server").into(),
        };

        let msg = match serialize::read_msg(&mut bytes.reader()) {
            Ok(msg) => msg,
            Err(e) => break Error::Protocol(format!("undecodable reply: {}", e)),
        };
        debug!("\t← {:?}", msg);

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let conn = Conn(inner);
        let tx = conn.shared().tagmap.get(&msg.tag).cloned();
        match tx {
            Some(tx) => {
                let tag = msg.tag;
                if tx.send(msg).is_err() {
                    // Nobody is waiting any more: the tag can be reused.
                    conn.puttag(tag);
                }
            }
            None => warn!("discarding reply with unknown tag {}: {:?}", msg.tag, msg.body),
        }
    };

    if let Some(inner) = inner.upgrade() {
        let conn = Conn(inner);
        if conn.error().is_none() {
            error!("connection failed: {}", err);
        }
        conn.fail(err);
    }
}
