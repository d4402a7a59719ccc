//! Range header parsing with the degradation rules of the streaming layer.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDecision {
    /// Serve the whole body with 200 (no header, syntax error, or a suffix
    /// range against an unknown size).
    Full,
    /// Serve `[start, end]`; `end = None` when the size is unknown and the
    /// range was open-ended.
    Partial { start: u64, end: Option<u64> },
    /// 416 with `Content-Range: bytes */<size>`.
    Unsatisfiable,
}

pub fn parse_range(header: Option<&str>, size: Option<u64>) -> RangeDecision {
    let Some(header) = header else {
        return RangeDecision::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeDecision::Full;
    };
    // Multi-range requests degrade to a full response.
    if spec.contains(',') {
        return RangeDecision::Full;
    }

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeDecision::Full;
    };
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if start_str.is_empty() {
        // Suffix range bytes=-n.
        let Ok(suffix) = end_str.parse::<u64>() else {
            return RangeDecision::Full;
        };
        let Some(size) = size else {
            // Unknown size cannot honor a suffix; degrade to 200.
            return RangeDecision::Full;
        };
        if suffix == 0 {
            return RangeDecision::Unsatisfiable;
        }
        let start = size.saturating_sub(suffix);
        if size == 0 {
            return RangeDecision::Unsatisfiable;
        }
        return RangeDecision::Partial {
            start,
            end: Some(size - 1),
        };
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeDecision::Full;
    };

    if end_str.is_empty() {
        // Open range bytes=a-.
        return match size {
            Some(size) if start >= size => RangeDecision::Unsatisfiable,
            Some(size) => RangeDecision::Partial {
                start,
                end: Some(size - 1),
            },
            None => RangeDecision::Partial { start, end: None },
        };
    }

    let Ok(end) = end_str.parse::<u64>() else {
        return RangeDecision::Full;
    };
    if end < start {
        return RangeDecision::Full;
    }

    match size {
        Some(size) if start >= size => RangeDecision::Unsatisfiable,
        Some(size) => RangeDecision::Partial {
            start,
            end: Some(end.min(size - 1)),
        },
        None => RangeDecision::Partial {
            start,
            end: Some(end),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range_clamps_to_size() {
        assert_eq!(
            parse_range(Some("bytes=100-199"), Some(1000)),
            RangeDecision::Partial {
                start: 100,
                end: Some(199)
            }
        );
        assert_eq!(
            parse_range(Some("bytes=900-2000"), Some(1000)),
            RangeDecision::Partial {
                start: 900,
                end: Some(999)
            }
        );
    }

    #[test]
    fn out_of_bounds_start_is_unsatisfiable() {
        assert_eq!(
            parse_range(Some("bytes=2000-2999"), Some(1000)),
            RangeDecision::Unsatisfiable
        );
        assert_eq!(
            parse_range(Some("bytes=1000-"), Some(1000)),
            RangeDecision::Unsatisfiable
        );
    }

    #[test]
    fn suffix_ranges() {
        assert_eq!(
            parse_range(Some("bytes=-100"), Some(1000)),
            RangeDecision::Partial {
                start: 900,
                end: Some(999)
            }
        );
        // Suffix longer than the file serves everything.
        assert_eq!(
            parse_range(Some("bytes=-5000"), Some(1000)),
            RangeDecision::Partial {
                start: 0,
                end: Some(999)
            }
        );
        // Unknown size degrades a suffix to 200.
        assert_eq!(parse_range(Some("bytes=-100"), None), RangeDecision::Full);
    }

    #[test]
    fn unknown_size_open_range_stays_partial() {
        assert_eq!(
            parse_range(Some("bytes=100-"), None),
            RangeDecision::Partial {
                start: 100,
                end: None
            }
        );
    }

    #[test]
    fn garbage_degrades_to_full() {
        assert_eq!(parse_range(Some("bytes=abc-def"), Some(10)), RangeDecision::Full);
        assert_eq!(parse_range(Some("items=0-5"), Some(10)), RangeDecision::Full);
        assert_eq!(parse_range(Some("bytes=5-2"), Some(10)), RangeDecision::Full);
        assert_eq!(parse_range(Some("bytes=0-1,5-6"), Some(10)), RangeDecision::Full);
        assert_eq!(parse_range(None, Some(10)), RangeDecision::Full);
    }
}
