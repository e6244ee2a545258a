//! Opening connections from dial strings.

use {
    crate::{
        conn::{Conn, ConnConfig},
        fsys::Fsys,
        io_err, res,
        utils::{self, Result},
    },
    log::info,
    tokio::net::{TcpStream, UnixStream},
};

/// Connect to `addr`, either `tcp!host!port` or `unix!path`, and negotiate
/// a version.
pub async fn dial(addr: &str, config: ConnConfig) -> Result<Conn> {
    let (proto, addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, format!("invalid dial string {:?}", addr)))?;

    match proto {
        "tcp" => {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            info!("connected to tcp {}", addr);
            let (readhalf, writehalf) = stream.into_split();
            Conn::new(readhalf, writehalf, config).await
        }
        "unix" => {
            let stream = UnixStream::connect(&addr).await?;
            info!("connected to unix {}", addr);
            let (readhalf, writehalf) = stream.into_split();
            Conn::new(readhalf, writehalf, config).await
        }
        _ => res!(io_err!(InvalidInput, format!("protocol {:?} not supported", proto))),
    }
}

/// Dial `addr` and attach to `aname` as the user named by `$USER`.
pub async fn mount(addr: &str, aname: &str, config: ConnConfig) -> Result<Fsys> {
    let user = std::env::var("USER").unwrap_or_else(|_| "none".to_owned());
    let conn = dial(addr, config).await?;
    conn.attach(None, &user, aname).await
}
