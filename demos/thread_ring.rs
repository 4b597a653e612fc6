//! Ring and reduction on the thread-emulated backend.
//!
//! No MPI needed: each rank is a thread of this process.
//!
//! Run with: RUST_LOG=mpcomm=debug cargo run --example thread_ring -- 6

use mpcomm::{Result, RuntimeConfig, ThreadRuntime, ANY_SOURCE};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let size: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);

    let runtime = ThreadRuntime::new(RuntimeConfig::from_env());
    let lines = runtime.run(size, |ctx| -> Result<String> {
        let rank = ctx.rank();
        let next = (rank + 1) % ctx.size();

        let mut incoming = [0i32];
        let mut recv = ctx.irecv(&mut incoming, ANY_SOURCE, 7)?;
        ctx.send(&[rank], next, 7)?;
        let status = recv.wait()?.expect("receives report a status");
        drop(recv);

        let total = ctx.allsum(rank)?;
        Ok(format!(
            "rank {rank}: got {} from rank {} (tag {}), sum of ranks = {total}",
            incoming[0], status.source, status.tag
        ))
    })?;

    for line in lines {
        println!("{}", line?);
    }
    runtime.shutdown();
    Ok(())
}
