//! Requests that can be submitted to a sequencer, and their results.

use {
    crate::{
        fcall::{Dir, MsgType, Qid},
        fid::Fid,
        sequencer::Sequencer,
        utils::Result,
    },
    async_trait::async_trait,
    std::fmt,
};

/// An operation that maps onto exactly one 9P request.
#[derive(Clone, Debug)]
pub enum BasicReq {
    /// Walk with no names: make `newfid` a copy of the file.
    Clone { newfid: Fid },
    Create { name: String, perm: u32, mode: u8 },
    /// Walk the file in place by one name.
    Walk { name: String },
    Open { mode: u8 },
    /// Read up to `buf.len()` bytes at `offset`. The buffer comes back in the result.
    Read { buf: Vec<u8>, offset: u64 },
    Write { data: Vec<u8>, offset: u64 },
    Stat,
    Wstat { stat: Dir },
    Remove,
    Clunk,
    /// Flush the current sequence, failing it with `Aborted`.
    Abort,
    /// Detach the file from the sequence that created it.
    Nonseq,
}

impl BasicReq {
    /// The 9P request this operation is sent as.
    pub fn msg_type(&self) -> MsgType {
        match self {
            BasicReq::Clone { .. } | BasicReq::Walk { .. } => MsgType::TWalk,
            BasicReq::Create { .. } => MsgType::TCreate,
            BasicReq::Open { .. } => MsgType::TOpen,
            BasicReq::Read { .. } => MsgType::TRead,
            BasicReq::Write { .. } => MsgType::TWrite,
            BasicReq::Stat => MsgType::TStat,
            BasicReq::Wstat { .. } => MsgType::TWStat,
            BasicReq::Remove => MsgType::TRemove,
            BasicReq::Clunk => MsgType::TClunk,
            BasicReq::Abort => MsgType::TFlush,
            BasicReq::Nonseq => MsgType::TNonseq,
        }
    }
}

/// Result of one operation, or the aggregate result of a composite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeqResult {
    Clone,
    Create(Qid),
    Walk(Qid),
    Open(Qid),
    /// The read buffer, truncated to the number of bytes read.
    Read(Vec<u8>),
    /// Number of bytes the server accepted.
    Write(u32),
    Stat(Dir),
    Wstat,
    Remove,
    Clunk,
    Nonseq,
    /// Results of the operations of a `SeqOps`, in order.
    Ops(Vec<SeqResult>),
    /// Qids of the names walked by a `PathWalk`.
    PathWalk(Vec<Qid>),
    Str(String),
}

/// A request that expands into further requests, usually inside its own
/// subsequence.
///
/// `run` is called from `Sequencer::do_op` in place of submitting a single
/// operation. It must end every subsequence it begins.
#[async_trait]
pub trait CompositeReq: Send + Sync + fmt::Debug {
    async fn run(self: Box<Self>, seq: &Sequencer, file: Option<&Fid>) -> Result<()>;
}

/// Anything `Sequencer::do_op` accepts.
#[derive(Debug)]
pub enum Req {
    Basic(BasicReq),
    Composite(Box<dyn CompositeReq>),
}

impl Req {
    pub fn composite<C: CompositeReq + 'static>(c: C) -> Req {
        Req::Composite(Box::new(c))
    }
}

impl From<BasicReq> for Req {
    fn from(r: BasicReq) -> Req {
        Req::Basic(r)
    }
}
