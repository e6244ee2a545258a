use {
    clap::{Parser, Subcommand},
    log::info,
    seq9p::{fcall::*, *},
    tokio::io::{AsyncReadExt, AsyncWriteExt},
};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Talk to a 9P2000 file server")]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(short, long, default_value = "tcp!127.0.0.1!564")]
    addr: String,

    /// File tree to attach to
    #[arg(long, default_value = "")]
    aname: String,

    #[arg(short, long, env = "USER", default_value = "none")]
    user: String,

    /// Largest message to negotiate
    #[arg(long, default_value_t = 8192 + IOHDRSZ)]
    msize: u32,

    /// Reads kept in flight by cat
    #[arg(long, default_value_t = 8)]
    nreqs: usize,

    /// Bytes per read; defaults to the connection's iounit
    #[arg(long)]
    iounit: Option<usize>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Copy files to standard output
    Cat { paths: Vec<String> },
    /// List directories
    Ls { paths: Vec<String> },
    /// Print file metadata
    Stat { paths: Vec<String> },
    /// Copy standard input into a file, creating it if needed
    Put {
        path: String,
        #[arg(long, default_value_t = 0o644)]
        perm: u32,
    },
    /// Remove files
    Rm { paths: Vec<String> },
    /// Make directories
    Mkdir {
        paths: Vec<String>,
        #[arg(long, default_value_t = 0o755)]
        perm: u32,
    },
}

fn mode_string(mode: u32) -> String {
    let mut s = String::with_capacity(11);
    s.push(if mode & dm::DIR != 0 {
        'd'
    } else if mode & dm::APPEND != 0 {
        'a'
    } else {
        '-'
    });
    s.push(if mode & dm::EXCL != 0 { 'l' } else { '-' });
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

fn print_dir(d: &Dir) {
    println!(
        "{} {:>8} {:>8} {:>10} {}",
        mode_string(d.mode),
        d.uid,
        d.gid,
        d.length,
        d.name
    );
}

async fn cat(ns: &Ns, path: &str, nreqs: usize, iounit: usize) -> Result<()> {
    let mut rs = ns.read_stream(path, nreqs, iounit).await?;
    let mut out = tokio::io::stdout();
    let n = rs.copy_to(&mut out).await?;
    info!("{}: {} bytes", path, n);
    Ok(())
}

async fn ls(ns: &Ns, path: &str) -> Result<()> {
    let d = ns.stat(path).await?;
    if !d.is_dir() {
        print_dir(&d);
        return Ok(());
    }
    let f = ns.open(path, om::READ).await?;
    let mut entries = Vec::new();
    loop {
        let batch = f.dirread().await?;
        if batch.is_empty() {
            break;
        }
        entries.extend(batch);
    }
    f.close().await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.iter().for_each(print_dir);
    Ok(())
}

async fn put(ns: &Ns, path: &str, perm: u32) -> Result<()> {
    let f = match ns.access(path, access::EXIST).await {
        Ok(()) => ns.open(path, om::WRITE | om::TRUNC).await?,
        Err(_) => ns.create(path, om::WRITE, perm).await?,
    };
    let mut buf = vec![0; f.fid().iounit() as usize];
    let mut stdin = tokio::io::stdin();
    let mut total = 0;
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut off = 0;
        while off < n {
            let w = f.write(&buf[off..n]).await?;
            if w == 0 {
                return res!(io_err!(WriteZero, "server accepted no data"));
            }
            off += w;
        }
        total += n;
    }
    info!("{}: wrote {} bytes", path, total);
    f.close().await
}

async fn s9p_main(cli: Cli) -> Result<i32> {
    let config = ConnConfig::default().with_msize(cli.msize);
    let conn = dial(&cli.addr, config).await?;
    let fsys = conn.attach(None, &cli.user, &cli.aname).await?;
    let ns = Ns::new(fsys.root().clone()).await?;
    let iounit = cli.iounit.unwrap_or(conn.iounit() as usize);

    let mut status = 0;
    let mut report = |path: &str, r: Result<()>| {
        if let Err(e) = r {
            eprintln!("{}: {}", path, e);
            status = 1;
        }
    };
    match &cli.cmd {
        Cmd::Cat { paths } => {
            for p in paths {
                report(p, cat(&ns, p, cli.nreqs, iounit).await);
            }
        }
        Cmd::Ls { paths } if paths.is_empty() => report(".", ls(&ns, ".").await),
        Cmd::Ls { paths } => {
            for p in paths {
                report(p, ls(&ns, p).await);
            }
        }
        Cmd::Stat { paths } => {
            for p in paths {
                let r = ns.stat(p).await.map(|d| {
                    println!("{:?}", d);
                });
                report(p, r);
            }
        }
        Cmd::Put { path, perm } => report(path, put(&ns, path, *perm).await),
        Cmd::Rm { paths } => {
            for p in paths {
                report(p, ns.remove(p).await);
            }
        }
        Cmd::Mkdir { paths, perm } => {
            for p in paths {
                let r = match ns.create(p, om::READ, dm::DIR | *perm).await {
                    Ok(d) => d.close().await,
                    Err(e) => Err(e),
                };
                report(p, r);
            }
        }
    }

    tokio::io::stdout().flush().await?;
    conn.close().await;
    Ok(status)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = s9p_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings() {
        assert_eq!(mode_string(dm::DIR | 0o755), "d-rwxr-xr-x");
        assert_eq!(mode_string(0o640), "--rw-r-----");
        assert_eq!(mode_string(dm::APPEND | dm::EXCL | 0o600), "alrw-------");
    }

    #[test]
    fn command_line() {
        let cli = Cli::try_parse_from(["s9p", "-a", "unix!/tmp/9p.sock!0", "cat", "a", "b"]).unwrap();
        assert_eq!(cli.addr, "unix!/tmp/9p.sock!0");
        assert_eq!(cli.nreqs, 8);
        assert!(matches!(cli.cmd, Cmd::Cat { paths } if paths == ["a", "b"]));
    }
}
