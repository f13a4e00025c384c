//! Chunk boundary scanning and reconciliation.
//!
//! A chunk's first byte may sit inside or outside a quoted field depending on
//! the parity of quote characters in everything before it, which is unknown
//! while chunks scan in parallel. Each scan therefore tracks two hypotheses
//! at once and the serial reconciliation pass picks the right one per chunk
//! from the running quote total.

use std::fs::File;

use memmap2::MmapOptions;

use crate::Result;

const QUOTE: u8 = b'"';
const LINE_SEP: u8 = b'\n';

/// Per-chunk scan result.
///
/// `newlines_even`/`first_newline_even` describe the hypothesis that the
/// chunk starts outside quotes; the `odd` pair assumes it starts inside.
/// First-newline offsets are absolute; `-1` means no newline exists under
/// that hypothesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStat {
    pub quotes: u64,
    pub newlines_even: u64,
    pub newlines_odd: u64,
    pub first_newline_even: i64,
    pub first_newline_odd: i64,
}

/// Start of one indexing chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    pub offset: u64,
    pub line: u64,
}

/// Scan `[lo, hi)` of the file, counting quotes and classifying newlines
/// under both parity hypotheses. Fails only on I/O, never on content.
pub fn scan_chunk(file: &File, lo: u64, hi: u64, window_size: usize) -> Result<ChunkStat> {
    let mut stat = ChunkStat {
        first_newline_even: -1,
        first_newline_odd: -1,
        ..ChunkStat::default()
    };
    if hi <= lo {
        return Ok(stat);
    }

    let window_size = window_size.max(4096) as u64;
    let mut pos = lo;
    while pos < hi {
        let len = (hi - pos).min(window_size) as usize;
        let map = unsafe { MmapOptions::new().offset(pos).len(len).map(file)? };
        for (i, &b) in map.iter().enumerate() {
            if b == QUOTE {
                stat.quotes += 1;
            } else if b == LINE_SEP {
                let abs = (pos + i as u64) as i64;
                if stat.quotes & 1 == 0 {
                    stat.newlines_even += 1;
                    if stat.first_newline_even < 0 {
                        stat.first_newline_even = abs;
                    }
                } else {
                    stat.newlines_odd += 1;
                    if stat.first_newline_odd < 0 {
                        stat.first_newline_odd = abs;
                    }
                }
            }
        }
        pos += len as u64;
    }
    Ok(stat)
}

/// Serial pass over the chunk stats: pick each chunk's hypothesis from the
/// running quote parity and emit indexing-chunk boundaries.
///
/// A chunk with no newline under its selected hypothesis (one huge quoted
/// field, or a single over-long line) is merged into its predecessor. The
/// result always ends with the synthetic `(file_len, _)` terminator, so
/// consecutive pairs form the indexing chunks.
pub fn reconcile_boundaries(stats: &[ChunkStat], file_len: u64) -> Vec<ChunkBoundary> {
    let mut boundaries = vec![ChunkBoundary { offset: 0, line: 0 }];
    if stats.is_empty() {
        boundaries.push(ChunkBoundary { offset: file_len, line: 0 });
        return boundaries;
    }

    // The first chunk starts the file: outside quotes by definition.
    let mut quotes_total = stats[0].quotes;
    let mut lines_total = stats[0].newlines_even + 1;

    for stat in &stats[1..] {
        let (first_newline, newlines) = if quotes_total & 1 == 1 {
            (stat.first_newline_odd, stat.newlines_odd)
        } else {
            (stat.first_newline_even, stat.newlines_even)
        };
        if first_newline >= 0 {
            boundaries.push(ChunkBoundary {
                offset: first_newline as u64 + 1,
                line: lines_total,
            });
        }
        quotes_total += stat.quotes;
        lines_total += newlines;
    }

    if boundaries[boundaries.len() - 1].offset < file_len {
        boundaries.push(ChunkBoundary { offset: file_len, line: lines_total });
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn scan_all(content: &[u8], chunk_size: u64) -> (Vec<ChunkStat>, u64) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.csv");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        let file = File::open(&path).unwrap();
        let len = content.len() as u64;

        let mut stats = Vec::new();
        let mut lo = 0;
        while lo < len {
            let hi = (lo + chunk_size).min(len);
            stats.push(scan_chunk(&file, lo, hi, 4096).unwrap());
            lo = hi;
        }
        (stats, len)
    }

    #[test]
    fn counts_quotes_and_newlines() {
        let (stats, _) = scan_all(b"a,\"x\"\nb,c\n", 100);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].quotes, 2);
        assert_eq!(stats[0].newlines_even, 2);
        assert_eq!(stats[0].newlines_odd, 0);
        assert_eq!(stats[0].first_newline_even, 5);
        assert_eq!(stats[0].first_newline_odd, -1);
    }

    #[test]
    fn newline_inside_quotes_counts_odd() {
        // newline at offset 3 is inside the quoted field
        let (stats, _) = scan_all(b"\"ab\ncd\",1\n", 100);
        assert_eq!(stats[0].newlines_even, 1);
        assert_eq!(stats[0].newlines_odd, 1);
        assert_eq!(stats[0].first_newline_odd, 3);
        assert_eq!(stats[0].first_newline_even, 9);
    }

    #[test]
    fn reconcile_plain_chunks() {
        let content = b"aaa,1\nbbb,2\nccc,3\nddd,4\n";
        let (stats, len) = scan_all(content, 8);
        let boundaries = reconcile_boundaries(&stats, len);
        // Every boundary except the terminator must start a line.
        for pair in boundaries.windows(2) {
            let off = pair[0].offset as usize;
            assert!(off == 0 || content[off - 1] == b'\n', "offset {off}");
        }
        assert_eq!(boundaries[boundaries.len() - 1].offset, len);
        assert_eq!(boundaries[0], ChunkBoundary { offset: 0, line: 0 });
    }

    #[test]
    fn reconcile_uses_odd_hypothesis_after_open_quote() {
        // Chunk 0 ends inside the quoted field; chunk 1 must use its odd
        // hypothesis so the boundary lands after the record's real end.
        let content = b"a,\"xxxxxxxx\nyyyyyyyy\",1\nb,2\n";
        let (stats, len) = scan_all(content, 8);
        assert_eq!(stats[0].quotes, 1);
        let boundaries = reconcile_boundaries(&stats, len);
        for pair in boundaries.windows(2) {
            let off = pair[0].offset as usize;
            assert!(off == 0 || content[off - 1] == b'\n', "offset {off} splits a record");
            // No boundary may land inside the quoted run (offsets 3..=20).
            assert!(!(3..=20).contains(&off), "offset {off} is inside quotes");
        }
    }

    #[test]
    fn chunk_swallowed_by_quoted_field_is_merged() {
        // Chunk 1 (bytes 8..16) is entirely inside the quoted field: no
        // newline under the odd hypothesis, so it merges into chunk 0.
        let mut content = Vec::new();
        content.extend_from_slice(b"a,\"");
        content.extend_from_slice(&[b'q'; 20]);
        content.extend_from_slice(b"\",1\nb,2\n");
        let (stats, len) = scan_all(&content, 8);
        let boundaries = reconcile_boundaries(&stats, len);
        for pair in boundaries.windows(2) {
            let off = pair[0].offset as usize;
            assert!(off == 0 || content[off - 1] == b'\n', "offset {off}");
        }
    }

    #[test]
    fn line_numbers_accumulate() {
        let content = b"a,1\nb,2\nc,3\nd,4\ne,5\nf,6\n";
        let (stats, len) = scan_all(content, 8);
        let boundaries = reconcile_boundaries(&stats, len);
        // Boundaries fall every two records with 8-byte chunks of 4-byte
        // lines; the running total starts at newlines_even + 1.
        assert_eq!(boundaries[1].line, 3);
        assert_eq!(boundaries[2].line, 5);
    }

    #[test]
    fn empty_stat_list_covers_whole_file() {
        let boundaries = reconcile_boundaries(&[], 100);
        assert_eq!(
            boundaries,
            vec![
                ChunkBoundary { offset: 0, line: 0 },
                ChunkBoundary { offset: 100, line: 0 }
            ]
        );
    }
}
