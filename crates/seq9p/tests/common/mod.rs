//! An in-memory 9P2000 file server with the sequencing extension, for tests.
//!
//! Messages are handled one at a time in arrival order, so every reply to a
//! sequence comes back in the order its requests were sent. The server counts
//! the messages it receives by type.

#![allow(dead_code)]

use {
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    seq9p::{Conn, ConnConfig, Fsys, fcall::*, serialize},
    std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex, MutexGuard},
    },
    tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf},
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec},
};

pub const ROOT: u64 = 0;

const ENOENT: &str = "file does not exist";
const EPERM: &str = "permission denied";

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: u64,
    qid: Qid,
    mode: u32,
    data: Vec<u8>,
    children: Vec<u64>,
    broken: bool,
}

/// The files served.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: HashMap<u64, Node>,
    next_path: u64,
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

impl Tree {
    pub fn new() -> Tree {
        let root = Node {
            name: "/".to_owned(),
            parent: ROOT,
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: ROOT,
            },
            mode: dm::DIR | 0o755,
            data: Vec::new(),
            children: Vec::new(),
            broken: false,
        };
        Tree {
            nodes: HashMap::from([(ROOT, root)]),
            next_path: 1,
        }
    }

    fn insert(&mut self, parent: u64, name: &str, mode: u32, data: Vec<u8>) -> u64 {
        let path = self.next_path;
        self.next_path += 1;
        let typ = if mode & dm::DIR != 0 {
            QidType::DIR
        } else {
            QidType::FILE
        };
        self.nodes.insert(
            path,
            Node {
                name: name.to_owned(),
                parent,
                qid: Qid {
                    typ,
                    version: 0,
                    path,
                },
                mode,
                data,
                children: Vec::new(),
                broken: false,
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(path);
        }
        path
    }

    fn child(&self, dir: u64, name: &str) -> Option<u64> {
        if name == ".." {
            return self.nodes.get(&dir).map(|n| n.parent);
        }
        self.nodes
            .get(&dir)?
            .children
            .iter()
            .copied()
            .find(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
    }

    fn parent_of(&mut self, path: &str) -> (u64, String) {
        let mut elems: Vec<&str> = path.split('/').filter(|e| !e.is_empty()).collect();
        let last = elems.pop().unwrap_or_default().to_owned();
        let mut at = ROOT;
        for e in elems {
            at = match self.child(at, e) {
                Some(c) => c,
                None => self.insert(at, e, dm::DIR | 0o755, Vec::new()),
            };
        }
        (at, last)
    }

    /// Add a file, creating missing directories on the way.
    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Tree {
        let (dir, name) = self.parent_of(path);
        self.insert(dir, &name, 0o644, data.into());
        self
    }

    pub fn dir(mut self, path: &str) -> Tree {
        let (dir, name) = self.parent_of(path);
        self.insert(dir, &name, dm::DIR | 0o755, Vec::new());
        self
    }

    /// Replace the permission bits of `path`.
    pub fn mode(mut self, path: &str, perm: u32) -> Tree {
        if let Some(p) = self.lookup(path) {
            if let Some(n) = self.nodes.get_mut(&p) {
                n.mode = (n.mode & dm::DIR) | perm;
            }
        }
        self
    }

    /// Make every read of `path` fail.
    pub fn broken(mut self, path: &str) -> Tree {
        if let Some(p) = self.lookup(path) {
            if let Some(n) = self.nodes.get_mut(&p) {
                n.broken = true;
            }
        }
        self
    }

    pub fn lookup(&self, path: &str) -> Option<u64> {
        path.split('/')
            .filter(|e| !e.is_empty())
            .try_fold(ROOT, |at, e| self.child(at, e))
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lookup(path)
            .and_then(|p| self.nodes.get(&p))
            .map(|n| n.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    fn stat(&self, path: u64) -> Option<Dir> {
        let n = self.nodes.get(&path)?;
        Some(Dir {
            typ: 0,
            dev: 0,
            qid: n.qid,
            mode: n.mode,
            atime: 0,
            mtime: 0,
            length: if n.mode & dm::DIR != 0 {
                0
            } else {
                n.data.len() as u64
            },
            name: n.name.clone(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
        })
    }
}

#[derive(Debug)]
struct ServerFid {
    node: u64,
    mode: Option<u8>,
    dirpos: usize,
}

#[derive(Debug, Default)]
struct ServerSeq {
    failed: bool,
    fids: HashSet<u32>,
}

#[derive(Debug)]
struct State {
    tree: Tree,
    msize: u32,
    fids: HashMap<u32, ServerFid>,
    seqs: HashMap<u16, ServerSeq>,
    counts: HashMap<MsgType, usize>,
    received: Vec<Msg>,
}

/// The test's view of a running server.
#[derive(Clone, Debug)]
pub struct Handle(Arc<Mutex<State>>);

impl Handle {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    /// Messages of type `typ` received so far.
    pub fn count(&self, typ: MsgType) -> usize {
        self.lock().counts.get(&typ).copied().unwrap_or(0)
    }

    /// Fids the server currently holds.
    pub fn fids(&self) -> usize {
        self.lock().fids.len()
    }

    /// Sequences begun and not yet ended.
    pub fn sequences(&self) -> usize {
        self.lock().seqs.len()
    }

    pub fn tree(&self) -> Tree {
        self.lock().tree.clone()
    }

    /// Every message received, in order.
    pub fn received(&self) -> Vec<Msg> {
        self.lock().received.clone()
    }
}

impl State {
    fn handle(&mut self, msg: &Msg) -> Option<FCall> {
        let tag = msg.tag;
        *self.counts.entry(MsgType::from(&msg.body)).or_insert(0) += 1;
        self.received.push(msg.clone());

        if let FCall::TBegin = msg.body {
            if self.seqs.contains_key(&tag) {
                return Some(error("sequence already begun"));
            }
            self.seqs.insert(tag, ServerSeq::default());
            return Some(FCall::RBegin);
        }

        let Some(seq) = self.seqs.get_mut(&tag) else {
            return Some(match &msg.body {
                FCall::TFlush { .. } => FCall::RFlush,
                FCall::TEnd | FCall::TNonseq { .. } => error("no sequence on this tag"),
                body => self.exec(body).unwrap_or_else(error),
            });
        };

        match &msg.body {
            FCall::TEnd => {
                self.seqs.remove(&tag);
                return Some(FCall::REnd);
            }
            _ if seq.failed => return None,
            FCall::TFlush { oldtag } if *oldtag == tag => {
                self.fail(tag);
                return Some(FCall::RFlush);
            }
            FCall::TNonseq { fid } => {
                seq.fids.remove(fid);
                return Some(FCall::RNonseq);
            }
            _ => {}
        }

        match self.exec(&msg.body) {
            Ok(reply) => {
                if let Some(seq) = self.seqs.get_mut(&tag) {
                    match &msg.body {
                        FCall::TWalk { fid, newfid, .. } if fid != newfid => {
                            seq.fids.insert(*newfid);
                        }
                        FCall::TClunk { fid } | FCall::TRemove { fid } => {
                            seq.fids.remove(fid);
                        }
                        _ => {}
                    }
                }
                Some(reply)
            }
            Err(e) => {
                if let FCall::TRemove { fid } = &msg.body {
                    if let Some(seq) = self.seqs.get_mut(&tag) {
                        seq.fids.remove(fid);
                    }
                }
                self.fail(tag);
                Some(error(e))
            }
        }
    }

    /// Fail the sequence on `tag`, clunking the fids it created.
    fn fail(&mut self, tag: u16) {
        if let Some(seq) = self.seqs.get_mut(&tag) {
            seq.failed = true;
            for fid in seq.fids.drain() {
                self.fids.remove(&fid);
            }
        }
    }

    fn fid(&mut self, fid: u32) -> Result<&mut ServerFid, String> {
        self.fids.get_mut(&fid).ok_or_else(|| "unknown fid".to_owned())
    }

    fn node(&self, path: u64) -> Result<&Node, String> {
        self.tree.nodes.get(&path).ok_or_else(|| ENOENT.to_owned())
    }

    fn exec(&mut self, body: &FCall) -> Result<FCall, String> {
        match body {
            FCall::TVersion { msize, version } => {
                self.fids.clear();
                self.seqs.clear();
                self.msize = self.msize.min(*msize);
                let version = if version.starts_with(P92000) {
                    P92000
                } else {
                    VERSION_UNKNOWN
                };
                Ok(FCall::RVersion {
                    msize: self.msize,
                    version: version.to_owned(),
                })
            }
            FCall::TAuth { .. } => Err("authentication not required".to_owned()),
            FCall::TAttach { fid, .. } => {
                if self.fids.contains_key(fid) {
                    return Err("fid in use".to_owned());
                }
                self.fids.insert(
                    *fid,
                    ServerFid {
                        node: ROOT,
                        mode: None,
                        dirpos: 0,
                    },
                );
                Ok(FCall::RAttach {
                    qid: self.node(ROOT)?.qid,
                })
            }
            FCall::TWalk {
                fid,
                newfid,
                wnames,
            } => {
                let start = self.fid(*fid)?.node;
                if newfid != fid && self.fids.contains_key(newfid) {
                    return Err("fid in use".to_owned());
                }
                let mut at = start;
                let mut wqids = Vec::new();
                for (i, name) in wnames.iter().enumerate() {
                    let next = if self.node(at)?.mode & dm::DIR == 0 {
                        None
                    } else {
                        self.tree.child(at, name)
                    };
                    match next {
                        Some(n) => {
                            at = n;
                            wqids.push(self.node(n)?.qid);
                        }
                        None if i == 0 => return Err(ENOENT.to_owned()),
                        None => break,
                    }
                }
                if wqids.len() == wnames.len() {
                    self.fids.insert(
                        *newfid,
                        ServerFid {
                            node: at,
                            mode: None,
                            dirpos: 0,
                        },
                    );
                }
                Ok(FCall::RWalk { wqids })
            }
            FCall::TOpen { fid, mode } => {
                let f = self.fid(*fid)?;
                if f.mode.is_some() {
                    return Err("fid already open".to_owned());
                }
                let node = f.node;
                let n = self.node(node)?;
                let is_dir = n.mode & dm::DIR != 0;
                let (read, write, exec) = match mode & 3 {
                    om::READ => (true, false, false),
                    om::WRITE => (false, true, false),
                    om::RDWR => (true, true, false),
                    _ => (false, false, true),
                };
                let write = write || mode & om::TRUNC != 0;
                if is_dir && (write || exec) {
                    return Err("is a directory".to_owned());
                }
                if (read && n.mode & 0o444 == 0)
                    || (write && n.mode & 0o222 == 0)
                    || (exec && n.mode & 0o111 == 0)
                {
                    return Err(EPERM.to_owned());
                }
                let qid = n.qid;
                if mode & om::TRUNC != 0 {
                    if let Some(n) = self.tree.nodes.get_mut(&node) {
                        n.data.clear();
                    }
                }
                let f = self.fid(*fid)?;
                f.mode = Some(*mode);
                f.dirpos = 0;
                Ok(FCall::ROpen { qid, iounit: 0 })
            }
            FCall::TCreate {
                fid,
                name,
                perm,
                mode,
            } => {
                let f = self.fid(*fid)?;
                if f.mode.is_some() {
                    return Err("fid already open".to_owned());
                }
                let dir = f.node;
                if self.node(dir)?.mode & dm::DIR == 0 {
                    return Err("not a directory".to_owned());
                }
                if self.tree.child(dir, name).is_some() {
                    return Err("file exists".to_owned());
                }
                let path = self.tree.insert(dir, name, *perm, Vec::new());
                let qid = self.node(path)?.qid;
                let f = self.fid(*fid)?;
                f.node = path;
                f.mode = Some(*mode);
                Ok(FCall::RCreate { qid, iounit: 0 })
            }
            FCall::TRead { fid, offset, count } => {
                let f = self.fid(*fid)?;
                match f.mode {
                    Some(m) if m & 3 != om::WRITE => {}
                    _ => return Err("fid not open for reading".to_owned()),
                }
                let node = f.node;
                let mut dirpos = f.dirpos;
                let n = self.node(node)?;
                if n.broken {
                    return Err("i/o error".to_owned());
                }
                let data = if n.mode & dm::DIR != 0 {
                    if *offset == 0 {
                        dirpos = 0;
                    }
                    let mut out = Vec::new();
                    for c in n.children.iter().skip(dirpos) {
                        let Some(d) = self.tree.stat(*c) else {
                            continue;
                        };
                        if out.len() + d.size() as usize + 2 > *count as usize {
                            break;
                        }
                        out.extend(serialize::pack_dirs(&[d]).map_err(|e| e.to_string())?);
                        dirpos += 1;
                    }
                    out
                } else {
                    let start = (*offset as usize).min(n.data.len());
                    let end = (start + *count as usize).min(n.data.len());
                    n.data[start..end].to_vec()
                };
                self.fid(*fid)?.dirpos = dirpos;
                Ok(FCall::RRead { data: Data(data) })
            }
            FCall::TWrite { fid, offset, data } => {
                let f = self.fid(*fid)?;
                match f.mode {
                    Some(m) if matches!(m & 3, om::WRITE | om::RDWR) => {}
                    _ => return Err("fid not open for writing".to_owned()),
                }
                let node = f.node;
                let n = self
                    .tree
                    .nodes
                    .get_mut(&node)
                    .ok_or_else(|| ENOENT.to_owned())?;
                let start = *offset as usize;
                let end = start + data.0.len();
                if n.data.len() < end {
                    n.data.resize(end, 0);
                }
                n.data[start..end].copy_from_slice(&data.0);
                n.qid.version += 1;
                Ok(FCall::RWrite {
                    count: data.0.len() as u32,
                })
            }
            FCall::TClunk { fid } => {
                self.fids
                    .remove(fid)
                    .ok_or_else(|| "unknown fid".to_owned())?;
                Ok(FCall::RClunk)
            }
            FCall::TRemove { fid } => {
                let f = self
                    .fids
                    .remove(fid)
                    .ok_or_else(|| "unknown fid".to_owned())?;
                if f.node == ROOT {
                    return Err(EPERM.to_owned());
                }
                let n = self.node(f.node)?;
                if !n.children.is_empty() {
                    return Err("directory not empty".to_owned());
                }
                let parent = n.parent;
                self.tree.nodes.remove(&f.node);
                if let Some(p) = self.tree.nodes.get_mut(&parent) {
                    p.children.retain(|c| *c != f.node);
                }
                Ok(FCall::RRemove)
            }
            FCall::TStat { fid } => {
                let node = self.fid(*fid)?.node;
                let stat = self.tree.stat(node).ok_or_else(|| ENOENT.to_owned())?;
                Ok(FCall::RStat { stat })
            }
            FCall::TWStat { fid, stat } => {
                let node = self.fid(*fid)?.node;
                let parent = self.node(node)?.parent;
                if !stat.name.is_empty() {
                    if let Some(other) = self.tree.child(parent, &stat.name) {
                        if other != node {
                            return Err("file exists".to_owned());
                        }
                    }
                }
                let n = self
                    .tree
                    .nodes
                    .get_mut(&node)
                    .ok_or_else(|| ENOENT.to_owned())?;
                if !stat.name.is_empty() {
                    n.name = stat.name.clone();
                }
                if stat.length != !0 {
                    n.data.resize(stat.length as usize, 0);
                }
                if stat.mode != !0 {
                    n.mode = (n.mode & dm::DIR) | (stat.mode & !dm::DIR);
                }
                Ok(FCall::RWStat)
            }
            body => Err(format!("unsupported {:?}", MsgType::from(body))),
        }
    }
}

fn error(ename: impl Into<String>) -> FCall {
    FCall::RError {
        ename: ename.into(),
    }
}

async fn serve<R, W>(state: Handle, reader: R, writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let mut framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);

    while let Some(Ok(bytes)) = framedread.next().await {
        let Ok(msg) = serialize::read_msg(&mut bytes.reader()) else {
            return;
        };
        let Some(body) = state.lock().handle(&msg) else {
            continue;
        };
        let response = Msg { tag: msg.tag, body };
        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        if serialize::write_msg(&mut writer, &response).is_err() {
            return;
        }
        if framedwrite.send(writer.into_inner().freeze()).await.is_err() {
            return;
        }
    }
}

/// Start a server for `tree` and return the client end of its transport.
pub fn spawn_server(tree: Tree, msize: u32) -> (DuplexStream, Handle) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let handle = Handle(Arc::new(Mutex::new(State {
        tree,
        msize,
        fids: HashMap::new(),
        seqs: HashMap::new(),
        counts: HashMap::new(),
        received: Vec::new(),
    })));
    let (r, w) = tokio::io::split(server);
    tokio::spawn(serve(handle.clone(), r, w));
    (client, handle)
}

pub async fn connect(tree: Tree) -> (Conn, Handle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (stream, handle) = spawn_server(tree, 65536);
    let conn = Conn::from_stream(stream, ConnConfig::default())
        .await
        .unwrap();
    (conn, handle)
}

pub async fn attach(tree: Tree) -> (Conn, Fsys, Handle) {
    let (conn, handle) = connect(tree).await;
    let fsys = conn.attach(None, "glenda", "").await.unwrap();
    (conn, fsys, handle)
}

/// The far end of a transport, driven by hand.
pub struct RawPeer {
    read: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
    write: FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>,
}

impl RawPeer {
    pub fn pair() -> (DuplexStream, RawPeer) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (r, w) = tokio::io::split(server);
        let codec = || {
            LengthDelimitedCodec::builder()
                .length_field_offset(0)
                .length_field_length(4)
                .length_adjustment(-4)
                .little_endian()
                .new_codec()
        };
        let peer = RawPeer {
            read: FramedRead::new(r, codec()),
            write: FramedWrite::new(w, codec()),
        };
        (client, peer)
    }

    pub async fn recv(&mut self) -> Option<Msg> {
        let bytes = self.read.next().await?.ok()?;
        serialize::read_msg(&mut bytes.reader()).ok()
    }

    pub async fn send(&mut self, tag: u16, body: FCall) {
        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, &Msg { tag, body }).unwrap();
        self.write.send(writer.into_inner().freeze()).await.unwrap();
    }

    /// Answer the version handshake with `msize` and `version`.
    pub async fn accept(&mut self, msize: u32, version: &str) {
        let msg = self.recv().await.unwrap();
        assert!(matches!(msg.body, FCall::TVersion { .. }));
        self.send(
            msg.tag,
            FCall::RVersion {
                msize,
                version: version.to_owned(),
            },
        )
        .await;
    }
}

/// Poll `cond` until it holds, for work that finishes in the background.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
