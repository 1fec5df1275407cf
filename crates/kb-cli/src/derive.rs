//! `--derive` argument syntax.
//!
//! ```text
//! pos:temperature
//! neg:cold storage          neg:moisture=hydrolysis risk
//! ind:color
//! boundary:temperature=above 60C
//! range:temperature=55..65
//! ```

use anyhow::{Context, Result, bail};
use kb_core::Derivation;

pub fn parse_derivation(arg: &str) -> Result<Derivation> {
    let (kind, rest) = arg
        .split_once(':')
        .with_context(|| format!("derivation '{arg}' must look like kind:target"))?;
    let rest = rest.trim();
    if rest.is_empty() {
        bail!("derivation '{arg}' has no target");
    }
    let derivation = match kind.trim().to_ascii_lowercase().as_str() {
        "pos" | "positive" => Derivation::positive(rest),
        "neg" | "negative" => match rest.split_once('=') {
            Some((target, reason)) => Derivation::negative(target.trim(), Some(reason.trim())),
            None => Derivation::negative(rest, None),
        },
        "ind" | "independent" => Derivation::independent(rest),
        "boundary" => {
            let (target, condition) = rest
                .split_once('=')
                .with_context(|| format!("boundary '{arg}' must look like boundary:target=condition"))?;
            Derivation::boundary(target.trim(), condition.trim())
        }
        "range" => {
            let (target, bounds) = rest
                .split_once('=')
                .with_context(|| format!("range '{arg}' must look like range:target=min..max"))?;
            let (min, max) = bounds
                .split_once("..")
                .with_context(|| format!("range '{arg}' must look like range:target=min..max"))?;
            let min: f64 = min.trim().parse().with_context(|| format!("bad range min in '{arg}'"))?;
            let max: f64 = max.trim().parse().with_context(|| format!("bad range max in '{arg}'"))?;
            Derivation::range(target.trim(), min, max)?
        }
        other => bail!("unknown derivation kind '{other}' (pos, neg, ind, boundary, range)"),
    };
    Ok(derivation)
}

/// Split `a,b , c` into trimmed, non-empty parts.
pub fn split_list(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
