//! `zingcore` embedding-shim binary.
//!
//! Boots a native [`zingcore_core::Runtime`], registers every capability
//! crate, and runs a fixed demo script: bind a `net/tcp` listener, accept
//! one loopback connection, echo a line back over it, and exit. Useful as a
//! smoke test for a fresh checkout and as a worked example of wiring the
//! capability registry up from outside the kernel crates.
//!
//! # Usage
//!
//! ```bash
//! zingcore --bind 127.0.0.1:0
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use zingcore_core::registry::OpenRequest;
use zingcore_core::{CoreError, Runtime};

/// The `zingcore` capability kernel demo.
#[derive(Parser, Debug)]
#[command(name = "zingcore")]
#[command(about = "Boots a zingcore runtime and runs a fixed TCP echo demo")]
#[command(version)]
struct Args {
    /// Address to bind the demo listener to.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn register_all(runtime: &Arc<Runtime>) -> Result<(), CoreError> {
    runtime.registry.register(zingcore_loop::descriptor(), Arc::new(zingcore_loop::open))?;
    runtime.registry.register(zingcore_net::descriptor(), Arc::new(zingcore_net::open))?;
    runtime.registry.register(zingcore_http::descriptor(), Arc::new(zingcore_http::open))?;
    runtime.registry.register(zingcore_caps::file_aio::descriptor(), Arc::new(zingcore_caps::file_aio::open))?;
    runtime.registry.register(zingcore_caps::event_bus::descriptor(), Arc::new(zingcore_caps::event_bus::open))?;
    runtime
        .registry
        .register(zingcore_caps::async_default::descriptor(), Arc::new(zingcore_caps::async_default::open))?;
    runtime.registry.register(zingcore_caps::sys_info::descriptor(), Arc::new(zingcore_caps::sys_info::open))?;
    runtime.registry.register(zingcore_caps::proc_env::descriptor(), Arc::new(zingcore_caps::proc_env::open))?;
    Ok(())
}

fn encode_tcp_params(host: &str, port: u16, flags: u32) -> Result<BytesMut, Box<dyn std::error::Error>> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(u32::try_from(host.len())?);
    buf.put_slice(host.as_bytes());
    buf.put_u32_le(u32::from(port));
    buf.put_u32_le(flags);
    Ok(buf)
}

fn retry<T>(mut f: impl FnMut() -> Result<T, CoreError>, timeout: Duration) -> Result<T, CoreError> {
    let deadline = Instant::now() + timeout;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(CoreError::Again) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => return Err(e),
        }
    }
}

fn run_demo(runtime: &Arc<Runtime>, bind: &str) -> Result<(), Box<dyn std::error::Error>> {
    const LISTEN: u32 = 0x1;
    let (host, port) = bind.rsplit_once(':').ok_or("--bind must be host:port")?;
    let port: u16 = port.parse()?;

    let listener = runtime.registry.open(
        runtime,
        &OpenRequest { kind: "net", name: "tcp", version: 1, params: &encode_tcp_params(host, port, LISTEN)? },
    )?;
    let listener_ops = runtime.handles.lookup(listener)?;

    let mut port_buf = Vec::new();
    listener_ops.ctl(&1_u32.to_le_bytes(), &mut port_buf)?;
    let mut port_bytes = [0_u8; 4];
    port_bytes.copy_from_slice(&port_buf[..4]);
    let bound_port = u16::try_from(u32::from_le_bytes(port_bytes))?;
    tracing::info!(addr = %format!("{host}:{bound_port}"), "listening");

    let mut client = TcpStream::connect((host, bound_port))?;
    client.write_all(b"ping")?;

    let mut accept_buf = [0_u8; 32];
    let n = retry(|| listener_ops.read(&mut accept_buf), Duration::from_secs(5))?;
    if n != 32 {
        return Err("expected exactly one accept record".into());
    }
    let mut handle_bytes = [0_u8; 4];
    handle_bytes.copy_from_slice(&accept_buf[0..4]);
    let server_handle = u32::from_le_bytes(handle_bytes);
    let server_ops = runtime.handles.lookup(server_handle)?;

    let mut buf = [0_u8; 16];
    let n = retry(|| server_ops.read(&mut buf), Duration::from_secs(5))?;
    tracing::info!(received = %String::from_utf8_lossy(&buf[..n]), "server read");

    retry(|| server_ops.write(b"pong"), Duration::from_secs(5))?;

    client.set_read_timeout(Some(Duration::from_secs(5)))?;
    let n = client.read(&mut buf)?;
    tracing::info!(received = %String::from_utf8_lossy(&buf[..n]), "client read");

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("zingcore starting");

    let runtime = Arc::new(Runtime::new_native());
    register_all(&runtime)?;
    tracing::info!(capabilities = runtime.registry.count(), "capability registry ready");

    run_demo(&runtime, &args.bind)?;

    tracing::info!("demo complete");
    Ok(())
}
