//! Column-delimiter auto-detection.
//!
//! Scores a fixed set of candidate delimiters over the first buffer of the
//! file: for each candidate, count occurrences per line (quote-aware) and
//! prefer the candidate whose per-line count is non-zero and most stable.

use crate::{Result, StampedeError};

const CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Lines examined by the detector.
const MAX_LINES: usize = 64;

/// Detect the column delimiter from the first buffer of the file.
///
/// Returns an error when no candidate appears consistently; the caller then
/// has to be told the delimiter explicitly.
pub fn detect_delimiter(buf: &[u8]) -> Result<u8> {
    let mut best: Option<(u8, f64, f64)> = None; // (delim, mean, variance)

    for &cand in &CANDIDATES {
        let counts = per_line_counts(buf, cand);
        if counts.is_empty() {
            continue;
        }
        let n = counts.len() as f64;
        let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / n;
        if mean < 1.0 {
            continue;
        }
        let variance = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        let better = match best {
            None => true,
            Some((_, best_mean, best_var)) => {
                variance < best_var || (variance == best_var && mean > best_mean)
            }
        };
        if better {
            best = Some((cand, mean, variance));
        }
    }

    best.map(|(d, _, _)| d)
        .ok_or_else(|| StampedeError::Structure("could not detect column delimiter".into()))
}

/// Count candidate occurrences outside quotes, one entry per complete line.
fn per_line_counts(buf: &[u8], cand: u8) -> Vec<u32> {
    let mut counts = Vec::new();
    let mut in_quotes = false;
    let mut current = 0u32;
    let mut saw_any = false;

    for &b in buf {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            if b == b'\n' {
                if saw_any {
                    counts.push(current);
                }
                if counts.len() >= MAX_LINES {
                    break;
                }
                current = 0;
                saw_any = false;
                continue;
            }
            if b == cand {
                current += 1;
            }
        }
        if b != b'\r' {
            saw_any = true;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_comma() {
        let buf = b"ts,price,qty\n2020-01-01T00:00:00Z,1.5,10\n2020-01-02T00:00:00Z,2.5,20\n";
        assert_eq!(detect_delimiter(buf).unwrap(), b',');
    }

    #[test]
    fn detects_tab_over_comma_noise() {
        let buf = b"a\tb,x\tc\n1\t2\t3\n4\t5\t6\n";
        assert_eq!(detect_delimiter(buf).unwrap(), b'\t');
    }

    #[test]
    fn detects_semicolon() {
        let buf = b"a;b;c\n1;2;3\n";
        assert_eq!(detect_delimiter(buf).unwrap(), b';');
    }

    #[test]
    fn quoted_delimiters_do_not_count() {
        let buf = b"a|\"x,y,z,w,v\"\n1|\"p,q,r,s,t\"\n";
        assert_eq!(detect_delimiter(buf).unwrap(), b'|');
    }

    #[test]
    fn no_delimiter_is_an_error() {
        let buf = b"justoneword\nanother\n";
        assert!(detect_delimiter(buf).is_err());
    }
}
