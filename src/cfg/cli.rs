// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Resolves a (possibly relative) path to an absolute, canonicalized one.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Splits `NAME VALUE NAME VALUE ...` argv-style module-load arguments
/// (spec §6.1) into `(name, value)` pairs, the shape `Config::from_args`
/// expects.
pub fn parse_module_args(args: &[String]) -> Result<Vec<(&str, &str)>> {
    if args.len() % 2 != 0 {
        bail!("module arguments must come in NAME VALUE pairs, got {}", args.len());
    }
    Ok(args
        .chunks_exact(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_module_args_pairs_up_argv() {
        let args =
            vec!["TIMEOUT".to_string(), "500".to_string(), "IO_THREADS".to_string(), "2".to_string()];
        let pairs = parse_module_args(&args).expect("valid");
        assert_eq!(pairs, vec![("TIMEOUT", "500"), ("IO_THREADS", "2")]);
    }

    #[test]
    fn parse_module_args_rejects_odd_length() {
        let args = vec!["TIMEOUT".to_string()];
        assert!(parse_module_args(&args).is_err());
    }
}
