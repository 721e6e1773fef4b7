//! Discover a device, multiply two matrices and softmax the result.
//!
//! Run with `cargo run --example matmul`.

use std::sync::Arc;

use anyhow::Result;
use molten::prelude::*;
use molten_backend::GpuContext;

fn main() -> Result<()> {
    env_logger::init();

    let ctx = Arc::new(GpuContext::discover_blocking()?);
    let caps = ctx.caps();
    println!(
        "device: {} (headless: {}, low power: {})",
        caps.name, caps.headless, caps.low_power
    );

    let engine = Engine::new(ctx)?;

    let a = engine.tensor_from_slice(&[1., 2., 3., 4., 5., 6.], &[2, 3])?;
    let b = engine.tensor_from_slice(&[1., 2., 3., 4., 5., 6., 7., 8., 9.], &[3, 3])?;
    let c = engine.empty(&[2, 3])?;

    engine.matmul(&a, &b, &c)?;
    println!("a * b       = {:?}", engine.to_vec(&c)?);

    let probs = engine.softmax(&c, 1, &[])?;
    println!("softmax(c)  = {:?}", engine.to_vec(&probs)?);

    let shifted = engine.add_scalar(&c, 100., &[])?;
    println!("c + 100     = {:?}", engine.to_vec(&shifted)?);

    Ok(())
}
