//! Irregular all-to-all example.
//!
//! Rank `r` sends `r + 1` packets, the `k`-th one to rank `(r + k) % size`,
//! each carrying payloads of different lengths. Every rank then checks that
//! it received exactly the packets addressed to it.
//!
//! Run with: cargo build --features native --example exchange && mpiexec -n 4 ./target/debug/examples/exchange

use mpcomm::{exchange, recv_packet_count, Mpi, Result, XPacket};

fn main() -> Result<()> {
    let mpi = Mpi::init()?;
    let world = mpi.world();

    let rank = world.rank();
    let size = world.size();

    let send: Vec<XPacket> = (0..=rank)
        .map(|k| {
            XPacket::new((rank + k) % size)
                .with_bytes(vec![rank as u8; k as usize])
                .with_ints(vec![i64::from(rank); 3])
                .with_floats(vec![f64::from(k); (rank % 3) as usize])
        })
        .collect();

    let expected = recv_packet_count(&world, &send)?;
    let start_time = Mpi::wtime();
    let mut recv = Vec::new();
    exchange(&world, &mut recv, &send)?;
    let elapsed = Mpi::wtime() - start_time;

    assert_eq!(recv.len(), expected);
    for packet in &recv {
        assert_eq!(packet.ints, vec![i64::from(packet.rank); 3]);
        assert!(packet.bytes.iter().all(|&b| b == packet.rank as u8));
    }
    println!("Rank {rank}: received {} packets in {elapsed:.6}s", recv.len());

    world.barrier()?;
    if rank == 0 {
        println!("\nExchange test passed!");
    }
    Ok(())
}
