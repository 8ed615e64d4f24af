//! Reference client for fetchd.
//!
//! Sends the request one byte at a time and reads the response in small,
//! delayed reads, so the server sees fragmented requests and a slow reader.

use clap::Parser;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const READ_SIZE: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "fetch")]
#[command(about = "Fetch a file from a fetchd server", long_about = None)]
struct Args {
    /// Server host name or address
    host: String,

    /// Server port
    port: u16,

    /// Path of the file to fetch, as the server sees it
    path: String,

    /// Send the whole request in one write and read without delay
    #[arg(long)]
    fast: bool,

    /// Delay between request bytes, in milliseconds
    #[arg(long, default_value_t = 1000)]
    send_delay_ms: u64,

    /// Delay between response reads, in milliseconds
    #[arg(long, default_value_t = 500)]
    read_delay_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))?;
    info!(peer = %stream.peer_addr()?, "Connected");

    let request = format!("{}\r\n", args.path);
    if args.fast {
        stream.write_all(request.as_bytes())?;
    } else {
        send_slowly(&mut stream, request.as_bytes(), Duration::from_millis(args.send_delay_ms))?;
    }

    let read_delay = if args.fast {
        Duration::ZERO
    } else {
        Duration::from_millis(args.read_delay_ms)
    };

    let started = Instant::now();
    let received = read_slowly(&mut stream, &mut io::stdout().lock(), read_delay)?;
    info!(
        bytes = received,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "All data received, disconnecting"
    );
    Ok(())
}

fn send_slowly(stream: &mut TcpStream, request: &[u8], delay: Duration) -> io::Result<()> {
    for (i, byte) in request.iter().enumerate() {
        if i > 0 {
            thread::sleep(delay);
        }
        stream.write_all(std::slice::from_ref(byte))?;
        debug!(byte = %byte.escape_ascii(), "Sent");
    }
    Ok(())
}

fn read_slowly(stream: &mut TcpStream, out: &mut impl Write, delay: Duration) -> io::Result<u64> {
    let mut buf = [0u8; READ_SIZE];
    let mut total = 0u64;
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        out.write_all(&buf[..n])?;
        total += n as u64;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
    out.flush()?;
    Ok(total)
}
