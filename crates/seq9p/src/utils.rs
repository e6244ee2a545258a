use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a dial string into its protocol and a socket address.
///
/// `tcp!host!port` yields `("tcp", "host:port")`, `unix!path` yields `("unix", "path")`.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;
    let addr = split.next()?;

    match (proto, split.next()) {
        ("tcp", Some(port)) => Some((proto, format!("{}:{}", addr, port))),
        ("unix", _) => Some((proto, addr.to_owned())),
        (_, Some(port)) => Some((proto, format!("{}:{}", addr, port))),
        (_, None) => None,
    }
}

/// Path elements of a slash separated name, with empty and `.` elements dropped.
pub fn elements(name: &str) -> Vec<String> {
    name.split('/')
        .filter(|e| !e.is_empty() && *e != ".")
        .map(str::to_owned)
        .collect()
}
