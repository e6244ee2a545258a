//! Attaching to a file tree, and path operations made of single requests.

use {
    crate::{
        conn::Conn,
        error::Error,
        fcall::*,
        fid::{Fid, FidState},
        utils::{Result, elements},
    },
    log::debug,
};

/// The open mode that exercises the rights in an `access` bit set.
pub(crate) fn access_omode(mode: u8) -> Result<u8> {
    const OMODE: [u8; 8] = [
        om::READ,
        om::EXEC,
        om::WRITE,
        om::RDWR,
        om::READ,
        om::EXEC,
        om::RDWR,
        om::RDWR,
    ];
    OMODE
        .get(mode as usize)
        .copied()
        .ok_or_else(|| Error::InvalidInput(format!("bad access mode {:#o}", mode)))
}

impl Conn {
    /// Start authenticating `uname` for `aname`. The returned fid carries the
    /// authentication protocol and may be read and written directly.
    pub async fn auth(&self, uname: &str, aname: &str) -> Result<Fid> {
        let afid = self.getfid()?;
        afid.set_state(FidState::Pending);
        let reply = self
            .rpc(FCall::TAuth {
                afid: afid.id(),
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await;
        match reply {
            Ok(FCall::RAuth { aqid }) => {
                afid.set_open(aqid, om::RDWR, 0);
                Ok(afid)
            }
            Ok(other) => {
                self.putfid(&afid);
                Err(self.protocol_error(format!("unexpected reply {:?}", MsgType::from(&other))))
            }
            Err(e) => {
                self.putfid(&afid);
                Err(e)
            }
        }
    }

    /// Attach to the tree `aname` as `user`.
    pub async fn attach(&self, afid: Option<&Fid>, user: &str, aname: &str) -> Result<Fsys> {
        let fid = self.getfid()?;
        fid.set_state(FidState::Pending);
        let reply = self
            .rpc(FCall::TAttach {
                fid: fid.id(),
                afid: afid.map_or(NOFID, Fid::id),
                uname: user.to_owned(),
                aname: aname.to_owned(),
            })
            .await;
        match reply {
            Ok(FCall::RAttach { qid }) => {
                fid.set_qid(qid);
                fid.set_state(FidState::Alloc);
                debug!("attached {:?} as {} with fid {}", aname, user, fid.id());
                Ok(Fsys { root: fid })
            }
            Ok(other) => {
                self.putfid(&fid);
                Err(self.protocol_error(format!("unexpected reply {:?}", MsgType::from(&other))))
            }
            Err(e) => {
                self.putfid(&fid);
                Err(e)
            }
        }
    }
}

/// An attached file tree.
#[derive(Debug, Clone)]
pub struct Fsys {
    root: Fid,
}

impl Fsys {
    pub fn new(root: Fid) -> Fsys {
        Fsys { root }
    }

    pub fn root(&self) -> &Fid {
        &self.root
    }

    /// A new fid for `path`, which is always taken relative to the root.
    pub async fn walk(&self, path: &str) -> Result<Fid> {
        self.root.walk(&elements(path)).await
    }

    pub async fn open(&self, path: &str, mode: u8) -> Result<Fid> {
        let f = self.walk(path).await?;
        if let Err(e) = f.open(mode).await {
            let _ = f.close().await;
            return Err(e);
        }
        Ok(f)
    }

    /// Create the last element of `path` in the directory named by the rest.
    pub async fn create(&self, path: &str, mode: u8, perm: u32) -> Result<Fid> {
        let mut elems = elements(path);
        let name = elems.pop().ok_or(Error::EmptyPath)?;
        let f = self.root.walk(&elems).await?;
        if let Err(e) = f.create(&name, perm, mode).await {
            let _ = f.close().await;
            return Err(e);
        }
        Ok(f)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.walk(path).await?.remove().await
    }

    pub async fn stat(&self, path: &str) -> Result<Dir> {
        let f = self.walk(path).await?;
        let r = f.stat().await;
        let _ = f.close().await;
        r
    }

    pub async fn wstat(&self, path: &str, dir: &Dir) -> Result<()> {
        let f = self.walk(path).await?;
        let r = f.wstat(dir).await;
        let _ = f.close().await;
        r
    }

    /// Check that `path` exists, or that it can be opened with the rights in
    /// `mode`, a set of `access` bits.
    pub async fn access(&self, path: &str, mode: u8) -> Result<()> {
        if mode == access::EXIST {
            return self.stat(path).await.map(|_| ());
        }
        let omode = access_omode(mode)?;
        self.open(path, omode).await?.close().await
    }
}
