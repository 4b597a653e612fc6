//! Ring communication example - point-to-point communication.
//!
//! Each process sends data to the next process in a ring pattern.
//!
//! Run with: cargo build --features native --example ring && mpiexec -n 4 ./target/debug/examples/ring

use mpcomm::{Mpi, Result};

fn main() -> Result<()> {
    let mpi = Mpi::init()?;
    let world = mpi.world();

    let rank = world.rank();
    let size = world.size();

    if size < 2 {
        if rank == 0 {
            eprintln!("This example requires at least 2 processes");
        }
        return Ok(());
    }

    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;

    let send_data = vec![rank as f64 * 100.0 + 1.0, rank as f64 * 100.0 + 2.0];
    let mut recv_data = vec![0.0; 2];

    println!("Rank {rank}: sending {send_data:?} to rank {next}");

    // Even ranks send first, odd ranks receive first
    let status = if rank % 2 == 0 {
        world.send(&send_data, next, 0)?;
        world.recv(&mut recv_data, prev, 0)?
    } else {
        let status = world.recv(&mut recv_data, prev, 0)?;
        world.send(&send_data, next, 0)?;
        status
    };
    println!(
        "Rank {}: received {:?} from rank {} (tag={}, count={})",
        rank, recv_data, status.source, status.tag, status.count
    );

    let expected = vec![prev as f64 * 100.0 + 1.0, prev as f64 * 100.0 + 2.0];
    assert_eq!(recv_data, expected, "Data mismatch!");

    // Sum of all ranks, checked against the closed form
    let total = world.allsum(rank)?;
    assert_eq!(total, size * (size - 1) / 2);

    world.barrier()?;

    if rank == 0 {
        println!("\nRing communication test passed!");
    }

    Ok(())
}
