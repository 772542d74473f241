//! Print the header and value summary of activation dump files.

use anyhow::{Context, Result};
use gap_quant::core::{load_dump, FLOAT_DOMAIN};
use std::path::PathBuf;

fn main() -> Result<()> {
    let files: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if files.is_empty() {
        anyhow::bail!("Usage: inspect_dump <file.bin>...");
    }

    for path in &files {
        let dump = load_dump(path).with_context(|| format!("reading {}", path.display()))?;
        let frac = dump.header.frac_bits;

        println!("{}", path.display());
        println!("  shape : {:?}", dump.shape());
        if frac == FLOAT_DOMAIN {
            println!("  domain: float");
        } else {
            println!("  domain: fixed, {frac} fraction bits");
        }

        if dump.values.is_empty() {
            println!("  (empty)");
            continue;
        }
        let (lo, hi) = dump
            .values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let mean = dump.values.iter().map(|&v| f64::from(v)).sum::<f64>() / dump.values.len() as f64;
        println!("  range : [{lo}, {hi}], mean {mean:.4}");

        if frac != FLOAT_DOMAIN {
            let scale = f64::from(frac).exp2();
            println!(
                "  real  : [{:.6}, {:.6}]",
                f64::from(lo) / scale,
                f64::from(hi) / scale
            );
        }
    }

    Ok(())
}
