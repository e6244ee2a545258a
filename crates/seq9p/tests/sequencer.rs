mod common;

use {
    common::{RawPeer, Tree, attach, spawn_server},
    seq9p::{
        BasicReq, Conn, ConnConfig, Error, FidState, PathWalk, SeqOps, SeqResult, Sequencer,
        fcall::*,
    },
    std::time::Duration,
    tokio::sync::mpsc,
};

async fn collect(mut rx: mpsc::UnboundedReceiver<SeqResult>) -> Vec<SeqResult> {
    let mut all = Vec::new();
    while let Some(r) = rx.recv().await {
        all.push(r);
    }
    all
}

fn walk(name: &str) -> BasicReq {
    BasicReq::Walk {
        name: name.to_owned(),
    }
}

#[tokio::test]
async fn pipelined_walk_open_read_clunk() {
    let (conn, fsys, srv) = attach(Tree::new().file("a/b", "hello world")).await;
    let root = fsys.root();
    let qa = root.walk(&["a"]).await.unwrap().qid();
    let qb = root.walk(&["a", "b"]).await.unwrap().qid();

    let f = conn.getfid().unwrap();
    let (seq, results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    seq.do_op(Some(&f), walk("a")).await.unwrap();
    seq.do_op(Some(&f), walk("b")).await.unwrap();
    seq.do_op(Some(&f), BasicReq::Open { mode: om::READ })
        .await
        .unwrap();
    seq.do_op(
        Some(&f),
        BasicReq::Read {
            buf: vec![0; 100],
            offset: 0,
        },
    )
    .await
    .unwrap();
    seq.do_op(Some(&f), BasicReq::Clunk).await.unwrap();
    seq.end();

    assert_eq!(
        collect(results).await,
        vec![
            SeqResult::Clone,
            SeqResult::Walk(qa),
            SeqResult::Walk(qb),
            SeqResult::Open(qb),
            SeqResult::Read(b"hello world".to_vec()),
            SeqResult::Clunk,
        ]
    );
    seq.wait().await.unwrap();
    assert_eq!(f.state(), FidState::Clunked);
    assert_eq!(srv.sequences(), 0);

    // One tag for the whole sequence, in submission order.
    let msgs = srv.received();
    let begin = msgs
        .iter()
        .position(|m| m.body == FCall::TBegin)
        .unwrap();
    let tag = msgs[begin].tag;
    let types: Vec<MsgType> = msgs[begin..]
        .iter()
        .filter(|m| m.tag == tag)
        .map(|m| MsgType::from(&m.body))
        .collect();
    assert_eq!(
        types,
        vec![
            MsgType::TBegin,
            MsgType::TWalk,
            MsgType::TWalk,
            MsgType::TWalk,
            MsgType::TOpen,
            MsgType::TRead,
            MsgType::TClunk,
            MsgType::TEnd,
        ]
    );
}

#[tokio::test]
async fn failure_mid_sequence_releases_clones() {
    let (conn, fsys, srv) = attach(Tree::new().file("a/x", "")).await;
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    seq.do_op(Some(&f), walk("a")).await.unwrap();
    seq.do_op(Some(&f), walk("b")).await.unwrap();
    seq.do_op(Some(&f), BasicReq::Open { mode: om::READ })
        .await
        .unwrap();
    seq.do_op(Some(&f), BasicReq::Clunk).await.unwrap();
    seq.end();

    let got = collect(results).await;
    assert_eq!(got.len(), 2);
    assert_eq!(got[0], SeqResult::Clone);
    assert!(matches!(got[1], SeqResult::Walk(_)));

    match seq.wait().await {
        Err(Error::Server(e)) => assert_eq!(e, "file does not exist"),
        r => panic!("unexpected {:?}", r),
    }
    assert!(matches!(seq.error(), Some(Error::Server(_))));
    assert_eq!(f.state(), FidState::Clunked);
    assert_eq!(srv.fids(), 1);
    assert_eq!(srv.sequences(), 0);
    // Nothing after the failure was answered, and nothing after it counts.
    assert_eq!(srv.count(MsgType::TEnd), 1);
}

#[tokio::test]
async fn subsequence_yields_one_result() {
    let (conn, fsys, _srv) = attach(Tree::new().file("f", "hello")).await;
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, results) = Sequencer::new();
    let (sub, mut inner) = seq.subsequencer("reader");
    let agg = sub.clone();
    let collector = tokio::spawn(async move {
        let mut n = 0;
        let mut data = Vec::new();
        while let Some(r) = inner.recv().await {
            n += 1;
            if let SeqResult::Read(d) = r {
                data = d;
            }
        }
        agg.result(Ok(SeqResult::Read(data)));
        n
    });

    sub.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    sub.do_op(Some(&f), walk("f")).await.unwrap();
    sub.do_op(Some(&f), BasicReq::Open { mode: om::READ })
        .await
        .unwrap();
    sub.do_op(
        Some(&f),
        BasicReq::Read {
            buf: vec![0; 64],
            offset: 0,
        },
    )
    .await
    .unwrap();
    sub.do_op(Some(&f), BasicReq::Clunk).await.unwrap();
    sub.end();
    seq.end();

    assert_eq!(collect(results).await, vec![SeqResult::Read(b"hello".to_vec())]);
    assert_eq!(collector.await.unwrap(), 5);
    seq.wait().await.unwrap();
    assert!(sub.error().is_none());
}

#[tokio::test]
async fn subsequence_failure_aborts_the_parent() {
    let (conn, fsys, srv) = attach(Tree::new().file("f", "hello")).await;
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Stat).await.unwrap();

    let (sub, mut inner) = seq.subsequencer("walker");
    let agg = sub.clone();
    tokio::spawn(async move {
        while inner.recv().await.is_some() {}
        match agg.error() {
            Some(e) => agg.result(Err(e)),
            None => agg.result(Ok(SeqResult::Str("walked".to_owned()))),
        }
    });
    sub.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    sub.do_op(Some(&f), walk("nope")).await.unwrap();
    sub.end();
    seq.end();

    let got = collect(results).await;
    assert_eq!(got.len(), 1);
    assert!(matches!(got[0], SeqResult::Stat(_)));

    assert!(matches!(seq.wait().await, Err(Error::Server(_))));
    assert!(matches!(sub.error(), Some(Error::Server(_))));
    assert!(matches!(seq.error(), Some(Error::Aborted)));
    assert!(matches!(seq.cause(), Some(Error::Server(_))));
    assert_eq!(f.state(), FidState::Clunked);
    assert_eq!(srv.fids(), 1);
}

#[tokio::test]
async fn abort_flushes_the_sequence() {
    let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    let (conn, fsys, srv) = attach(Tree::new().file("f", data.clone())).await;
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    seq.do_op(Some(&f), walk("f")).await.unwrap();
    seq.do_op(Some(&f), BasicReq::Open { mode: om::READ })
        .await
        .unwrap();
    for i in 0..20 {
        seq.do_op(
            Some(&f),
            BasicReq::Read {
                buf: vec![0; 10],
                offset: i * 10,
            },
        )
        .await
        .unwrap();
    }
    seq.do_op(None, BasicReq::Abort).await.unwrap();
    seq.end();

    let got = collect(results).await;
    let reads: Vec<Vec<u8>> = got
        .into_iter()
        .filter_map(|r| match r {
            SeqResult::Read(d) => Some(d),
            _ => None,
        })
        .collect();
    assert_eq!(reads.len(), 20);
    assert_eq!(reads.concat(), data);

    assert!(matches!(seq.wait().await, Err(Error::Aborted)));
    assert_eq!(srv.count(MsgType::TFlush), 1);
    assert_eq!(f.state(), FidState::Clunked);
    assert_eq!(srv.fids(), 1);
}

#[tokio::test]
async fn fids_owned_by_a_sequence_are_busy() {
    let (conn, fsys, _srv) = attach(Tree::new().file("f", "x")).await;
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, _results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    assert!(matches!(f.state(), FidState::SeqPending(_)));
    assert!(matches!(f.stat().await, Err(Error::FidBusy)));

    seq.do_op(Some(&f), walk("f")).await.unwrap();
    seq.end();
    seq.wait().await.unwrap();

    assert_eq!(f.state(), FidState::Alloc);
    assert_eq!(f.stat().await.unwrap().name, "f");
}

#[tokio::test]
async fn clone_into_a_live_fid_fails_the_tree() {
    let (_conn, fsys, srv) = attach(Tree::new()).await;
    let root = fsys.root();
    let other = root.walk::<&str>(&[]).await.unwrap();

    let (seq, _results) = Sequencer::new();
    let r = seq
        .do_op(Some(root), BasicReq::Clone { newfid: other.clone() })
        .await;
    assert!(matches!(r, Err(Error::FidInUse)));
    seq.end();
    assert!(matches!(seq.wait().await, Err(Error::FidInUse)));
    assert_eq!(other.state(), FidState::Alloc);
    assert_eq!(srv.sequences(), 0);
}

#[tokio::test]
async fn nonseq_detaches_a_fid_from_the_sequence() {
    let (conn, fsys, srv) = attach(Tree::new().file("f", "x")).await;
    let root = fsys.root();
    let kept = conn.getfid().unwrap();
    let lost = conn.getfid().unwrap();

    let (seq, _results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Clone { newfid: kept.clone() })
        .await
        .unwrap();
    seq.do_op(Some(&kept), BasicReq::Nonseq).await.unwrap();
    seq.do_op(Some(root), BasicReq::Clone { newfid: lost.clone() })
        .await
        .unwrap();
    seq.do_op(Some(&lost), walk("nope")).await.unwrap();
    seq.end();
    assert!(seq.wait().await.is_err());

    assert_eq!(kept.state(), FidState::Alloc);
    assert_eq!(lost.state(), FidState::Clunked);
    assert!(kept.stat().await.unwrap().qid.is_dir());
    assert_eq!(srv.fids(), 2);
}

#[tokio::test]
async fn submissions_after_end_are_refused() {
    let (_conn, fsys, _srv) = attach(Tree::new()).await;
    let (seq, _results) = Sequencer::new();
    seq.do_op(Some(fsys.root()), BasicReq::Stat).await.unwrap();
    seq.end();
    seq.end();
    assert!(matches!(
        seq.do_op(Some(fsys.root()), BasicReq::Stat).await,
        Err(Error::Terminated)
    ));
    seq.wait().await.unwrap();
}

#[tokio::test]
async fn oversized_reads_are_refused() {
    let (_conn, fsys, _srv) = attach(Tree::new().file("f", "x")).await;
    let f = fsys.open("f", om::READ).await.unwrap();
    let (seq, _results) = Sequencer::new();
    let r = seq
        .do_op(
            Some(&f),
            BasicReq::Read {
                buf: vec![0; 1 << 20],
                offset: 0,
            },
        )
        .await;
    assert!(matches!(r, Err(Error::InvalidInput(_))));
    seq.end();
    assert!(seq.wait().await.is_err());
}

#[tokio::test]
async fn request_too_large_for_the_connection_fails_the_tree() {
    let (stream, srv) = spawn_server(Tree::new(), 65536);
    let conn = Conn::from_stream(stream, ConnConfig::default().with_msize(256))
        .await
        .unwrap();
    let fsys = conn.attach(None, "glenda", "").await.unwrap();
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, _results) = Sequencer::new();
    seq.do_op(Some(root), BasicReq::Clone { newfid: f.clone() })
        .await
        .unwrap();
    let r = seq.do_op(Some(&f), walk(&"x".repeat(400))).await;
    assert!(matches!(r, Err(Error::InvalidInput(_))), "{:?}", r);
    seq.end();

    let done = tokio::time::timeout(Duration::from_secs(5), seq.wait())
        .await
        .expect("tree never finished");
    assert!(matches!(done, Err(Error::InvalidInput(_))), "{:?}", done);
    assert_eq!(f.state(), FidState::Clunked);
    assert_eq!(srv.fids(), 1);
    assert_eq!(srv.sequences(), 0);

    // The connection itself is fine.
    assert!(conn.error().is_none());
    root.stat().await.unwrap();
}

#[tokio::test]
async fn mismatched_reply_in_a_sequence_fails_the_connection() {
    let (stream, mut peer) = RawPeer::pair();
    let server = tokio::spawn(async move {
        peer.accept(8192, P92000).await;
        let m = peer.recv().await.unwrap();
        peer.send(m.tag, FCall::RAttach { qid: Qid::default() }).await;
        let begin = peer.recv().await.unwrap();
        assert_eq!(begin.body, FCall::TBegin);
        peer.send(begin.tag, FCall::RBegin).await;
        let stat = peer.recv().await.unwrap();
        assert_eq!(stat.tag, begin.tag);
        peer.send(stat.tag, FCall::RClunk).await;
        peer
    });

    let conn = Conn::from_stream(stream, ConnConfig::default())
        .await
        .unwrap();
    let fsys = conn.attach(None, "glenda", "").await.unwrap();
    let (seq, results) = Sequencer::new();
    seq.do_op(Some(fsys.root()), BasicReq::Stat).await.unwrap();
    seq.end();

    assert!(collect(results).await.is_empty());
    assert!(matches!(seq.wait().await, Err(Error::Protocol(_))));
    let _peer = server.await.unwrap();
    assert!(matches!(conn.error(), Some(Error::Protocol(_))));
    assert_eq!(fsys.root().state(), FidState::Clunked);
}

#[tokio::test]
#[should_panic(expected = "two producers")]
async fn concurrent_producers_are_refused() {
    let (_conn, fsys, _srv) = attach(Tree::new().file("f", "x")).await;
    let root = fsys.root();
    let (seq, _results) = Sequencer::new();
    let (sub, _sub_results) = seq.subsequencer("other");
    let _ = tokio::join!(
        seq.do_op(Some(root), BasicReq::Stat),
        sub.do_op(Some(root), BasicReq::Stat),
    );
}

#[tokio::test]
async fn composites_nest() {
    let (conn, fsys, _srv) = attach(Tree::new().file("a/b/c", "deep")).await;
    let root = fsys.root();
    let f = conn.getfid().unwrap();

    let (seq, results) = Sequencer::new();
    let names = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
    seq.do_op(Some(root), PathWalk::new(f.clone(), names))
        .await
        .unwrap();
    let ops = SeqOps::new([
        BasicReq::Open { mode: om::READ },
        BasicReq::Read {
            buf: vec![0; 16],
            offset: 0,
        },
    ]);
    seq.do_op(Some(&f), ops).await.unwrap();
    seq.end();

    let got = collect(results).await;
    assert_eq!(got.len(), 2);
    match &got[0] {
        SeqResult::PathWalk(qids) => {
            assert_eq!(qids.len(), 3);
            assert_eq!(qids[2], f.qid());
        }
        r => panic!("unexpected {:?}", r),
    }
    match &got[1] {
        SeqResult::Ops(rs) => {
            assert_eq!(rs.len(), 2);
            assert_eq!(rs[1], SeqResult::Read(b"deep".to_vec()));
        }
        r => panic!("unexpected {:?}", r),
    }
    seq.wait().await.unwrap();
    assert_eq!(f.state(), FidState::AllocOpen);
}
