//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// The running result of a chain of `<<` encodes; the first error sticks.
pub struct SResult<T>(::std::io::Result<T>);

impl<T> SResult<T> {
    fn into_result(self) -> Result<T> {
        self.0
    }
}

/// Counts the bytes written through it, so that `enc << &a << &b` reports
/// the encoded size of a whole message.
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<T: Encodable, W: WriteBytesExt> Shl<&T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(self, rhs: &T) -> Self::Output {
        SResult(Ok(self)) << rhs
    }
}

impl<T: Encodable, W: WriteBytesExt> Shl<&T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &T) -> Self::Output {
        SResult(self.0.and_then(|mut enc| enc.encode(rhs).map(|_| enc)))
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

macro_rules! le_int {
    ($($typ:ty => $write:ident, $read:ident;)*) => {$(
        impl Encodable for $typ {
            fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
                w.$write::<LittleEndian>(*self)?;
                Ok(mem::size_of::<$typ>())
            }
        }

        impl Decodable for $typ {
            fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
                r.$read::<LittleEndian>()
            }
        }
    )*};
}

le_int! {
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)?;
        Ok(1)
    }
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.typ.bits() << &self.version << &self.path)
            .into_result()
            .map(|enc| enc.bytes_written())
    }
}

/// A `Dir` is always preceded by its own size on the wire.
impl Encodable for Dir {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid)
            .into_result()
            .map(|enc| enc.bytes_written())
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
            .into_result()
            .map(|enc| enc.bytes_written())
    }
}

/// `Rstat` and `Twstat` carry the stat buffer behind an extra count.
fn stat_len(stat: &Dir) -> u16 {
    stat.size() + mem::size_of::<u16>() as u16
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << &stat_len(stat) << stat,
            TWStat { ref fid, ref stat } => buf << fid << &stat_len(stat) << stat,
            RWStat => buf,
            TBegin | RBegin | TEnd | REnd | RNonseq => buf,
            TNonseq { ref fid } => buf << fid,
        };

        buf.into_result().map(|b| b.bytes_written())
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Dir {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let mut body = Cursor::new(read_exact(r, size as usize)?);
        let r = &mut body;
        Ok(Dir {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

fn decode_stat<R: ReadBytesExt>(r: &mut R) -> Result<Dir> {
    let n: u16 = Decodable::decode(r)?;
    let mut body = Cursor::new(read_exact(r, n as usize)?);
    Decodable::decode(&mut body)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => FCall::RStat {
                stat: decode_stat(buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode_stat(buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            Some(TBegin) => FCall::TBegin,
            Some(RBegin) => FCall::RBegin,
            Some(TEnd) => FCall::TEnd,
            Some(REnd) => FCall::REnd,
            Some(TNonseq) => FCall::TNonseq { fid: decode!(buf) },
            Some(RNonseq) => FCall::RNonseq,
            None => return res!(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Split the payload of a directory read into its entries.
///
/// A trailing partial entry is an error: directory reads never split entries.
pub fn unpack_dirs(data: &[u8]) -> Result<Vec<Dir>> {
    let mut r = Cursor::new(data);
    let mut dirs = Vec::new();
    while (r.position() as usize) < data.len() {
        let d: Dir = Decodable::decode(&mut r)
            .map_err(|_| io_err!(InvalidData, "short directory entry"))?;
        dirs.push(d);
    }
    Ok(dirs)
}

/// Pack directory entries the way a directory read returns them.
pub fn pack_dirs(dirs: &[Dir]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for d in dirs {
        d.encode(&mut buf)?;
    }
    Ok(buf)
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    while let Ok(i) = Decodable::decode(&mut decoder) {
        actual.push(i);
    }
    assert_eq!(expected, actual);
}

#[test]
fn rstat_carries_double_size() {
    let stat = Dir {
        name: "x".to_owned(),
        ..Default::default()
    };
    let msg = Msg {
        tag: 3,
        body: FCall::RStat { stat: stat.clone() },
    };
    let mut buf = Vec::new();
    let n = msg.encode(&mut buf).unwrap();
    assert_eq!(n, buf.len());
    // type[1] tag[2] n[2] size[2] then the entry
    assert_eq!(buf.len(), 1 + 2 + 2 + 2 + stat.size() as usize);
    let n = u16::from_le_bytes([buf[3], buf[4]]);
    assert_eq!(n, stat.size() + 2);

    let actual = read_msg(&mut Cursor::new(buf)).unwrap();
    assert_eq!(msg, actual);
}

#[test]
fn sequencing_messages_have_empty_bodies() {
    let mut buf = Vec::new();
    write_msg(&mut buf, &Msg { tag: 7, body: FCall::TBegin }).unwrap();
    assert_eq!(buf, vec![140, 7, 0]);

    let mut buf = Vec::new();
    write_msg(&mut buf, &Msg { tag: 7, body: FCall::TNonseq { fid: 9 } }).unwrap();
    assert_eq!(buf, vec![144, 7, 0, 9, 0, 0, 0]);
}

#[test]
fn unknown_message_type_is_rejected() {
    let buf = vec![106u8, 0, 0];
    assert!(read_msg(&mut Cursor::new(buf)).is_err());
}

#[test]
fn directory_payload_splits_into_entries() {
    let dirs = vec![
        Dir {
            name: "a".to_owned(),
            ..Default::default()
        },
        Dir {
            name: "bb".to_owned(),
            mode: dm::DIR | 0o755,
            ..Default::default()
        },
    ];
    let buf = pack_dirs(&dirs).unwrap();
    assert_eq!(unpack_dirs(&buf).unwrap(), dirs);
    assert!(unpack_dirs(&buf[..buf.len() - 1]).is_err());
}
