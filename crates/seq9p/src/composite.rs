//! Composite requests built from basic operations.

use {
    crate::{
        error::Error,
        fid::Fid,
        req::{BasicReq, CompositeReq, Req, SeqResult},
        sequencer::Sequencer,
        utils::Result,
    },
    async_trait::async_trait,
    tokio::sync::mpsc,
};

/// Run `submit` inside `sub`, then end it whatever the outcome.
pub(crate) async fn within<F>(sub: &Sequencer, submit: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let r = submit.await;
    sub.end();
    r
}

/// Report `value` as the subsequence's result unless it has failed.
pub(crate) fn report(sub: &Sequencer, value: SeqResult) {
    match sub.error() {
        Some(e) => sub.result(Err(e)),
        None => sub.result(Ok(value)),
    }
}

/// Clone a file into `newfid` and walk the clone down `names`.
///
/// The subsequence's value is [`SeqResult::PathWalk`] with the qid of every
/// name walked.
#[derive(Debug)]
pub struct PathWalk {
    pub newfid: Fid,
    pub names: Vec<String>,
}

impl PathWalk {
    pub fn new(newfid: Fid, names: Vec<String>) -> PathWalk {
        PathWalk { newfid, names }
    }
}

impl From<PathWalk> for Req {
    fn from(w: PathWalk) -> Req {
        Req::composite(w)
    }
}

#[async_trait]
impl CompositeReq for PathWalk {
    async fn run(self: Box<Self>, seq: &Sequencer, file: Option<&Fid>) -> Result<()> {
        let file = file.ok_or_else(|| Error::InvalidInput("walk needs a file".to_owned()))?;
        let (sub, mut results) = seq.subsequencer("walk");

        let agg = sub.clone();
        tokio::spawn(async move {
            let mut qids = Vec::new();
            while let Some(r) = results.recv().await {
                if let SeqResult::Walk(q) = r {
                    qids.push(q);
                }
            }
            report(&agg, SeqResult::PathWalk(qids));
        });

        let PathWalk { newfid, names } = *self;
        within(&sub, async {
            sub.do_op(Some(file), BasicReq::Clone { newfid: newfid.clone() })
                .await?;
            for name in names {
                sub.do_op(Some(&newfid), BasicReq::Walk { name }).await?;
            }
            Ok(())
        })
        .await
    }
}

/// Run a list of requests on one file in a subsequence.
///
/// The subsequence's value is [`SeqResult::Ops`] with every result in order.
#[derive(Debug)]
pub struct SeqOps {
    pub ops: Vec<Req>,
}

impl SeqOps {
    pub fn new<I, R>(ops: I) -> SeqOps
    where
        I: IntoIterator<Item = R>,
        R: Into<Req>,
    {
        SeqOps {
            ops: ops.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<SeqOps> for Req {
    fn from(o: SeqOps) -> Req {
        Req::composite(o)
    }
}

#[async_trait]
impl CompositeReq for SeqOps {
    async fn run(self: Box<Self>, seq: &Sequencer, file: Option<&Fid>) -> Result<()> {
        let (sub, results) = seq.subsequencer("seqops");
        spawn_collector(sub.clone(), results);

        within(&sub, async {
            for op in self.ops {
                sub.do_op(file, op).await?;
            }
            Ok(())
        })
        .await
    }
}

/// Gather every result of `sub` into [`SeqResult::Ops`].
fn spawn_collector(sub: Sequencer, mut results: mpsc::UnboundedReceiver<SeqResult>) {
    tokio::spawn(async move {
        let mut all = Vec::new();
        while let Some(r) = results.recv().await {
            all.push(r);
        }
        report(&sub, SeqResult::Ops(all));
    });
}
