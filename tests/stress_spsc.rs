use std::sync::mpsc;
use std::time::{Duration, Instant};

use bipring::{BipBuffer, BipConfig, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CAPACITY: usize = 4096;
const FAST_CYCLES: usize = 1_000;
const DEFAULT_HEAVY_CYCLES: usize = 2_000_000;

#[test]
fn stress_spsc_fast() -> Result<()> {
    run_stress(FAST_CYCLES, 0x1234, Duration::from_secs(15))
}

#[test]
#[ignore]
fn stress_spsc_heavy() -> Result<()> {
    let cycles = env_usize("BIPRING_STRESS_CYCLES", DEFAULT_HEAVY_CYCLES);
    run_stress(cycles, 0xABCD, Duration::from_secs(120))
}

/// Producer commits `cycles` chunks of random length (at most a quarter of
/// the capacity) filled from a position-keyed byte pattern; the consumer
/// checks every byte against the pattern, then both sides compare CRCs of
/// everything they moved.
fn run_stress(cycles: usize, size_seed: u64, max_idle: Duration) -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let buffer = BipBuffer::<u8>::create_with_config(BipConfig {
        prefault: true,
        ..BipConfig::new(CAPACITY)
    })?;
    let (producer, consumer) = buffer.split();
    let (done_tx, done_rx) = mpsc::channel();

    let handle = std::thread::spawn(move || -> Result<(u64, u32)> {
        let mut sizes = StdRng::seed_from_u64(size_seed);
        let mut crc = crc32fast::Hasher::new();
        let mut total = 0u64;
        let mut last_progress = Instant::now();

        let mut cycle = 0;
        let mut size = sizes.gen_range(1..=CAPACITY / 4);
        while cycle < cycles {
            let mut grant = match producer.reserve(size) {
                Ok(grant) => grant,
                Err(err) if err.is_transient() => {
                    if last_progress.elapsed() > max_idle {
                        return Err(err);
                    }
                    std::thread::yield_now();
                    continue;
                }
                Err(err) => return Err(err),
            };
            fill_pattern(&mut grant, total);
            crc.update(&grant);
            total += size as u64;
            grant.commit(size)?;
            last_progress = Instant::now();
            cycle += 1;
            size = sizes.gen_range(1..=CAPACITY / 4);
        }
        let _ = done_tx.send(());
        Ok((total, crc.finalize()))
    });

    let mut scratch = vec![0u8; CAPACITY];
    let mut crc = crc32fast::Hasher::new();
    let mut total = 0u64;
    let mut last_progress = Instant::now();
    let mut producer_done = false;

    loop {
        let grant = consumer.read()?;
        let len = grant.len();
        if len > 0 {
            fill_pattern(&mut scratch[..len], total);
            assert!(
                grant[..] == scratch[..len],
                "corrupt window at offset {} after {total} bytes",
                grant.offset()
            );
            crc.update(&grant);
            total += len as u64;
            last_progress = Instant::now();
        }
        grant.release(len);

        if len == 0 {
            if producer_done && consumer.available() == 0 {
                break;
            }
            if !producer_done && done_rx.try_recv().is_ok() {
                producer_done = true;
                continue;
            }
            if last_progress.elapsed() > max_idle {
                panic!("consumer stalled after {total} bytes");
            }
            std::thread::yield_now();
        }
    }

    let (written, written_crc) = handle.join().expect("producer thread")?;
    assert_eq!(total, written);
    assert_eq!(crc.finalize(), written_crc);
    assert!(consumer.cursors().is_consistent(CAPACITY));
    Ok(())
}

fn fill_pattern(dst: &mut [u8], start: u64) {
    for (index, byte) in dst.iter_mut().enumerate() {
        let position = start + index as u64;
        *byte = (position.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 56) as u8;
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}
