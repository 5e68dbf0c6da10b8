use std::str::FromStr;

/// Track range selector: "5" (from track 5 to the end), "5:9" (inclusive),
/// or ":9" (from the first track). 1-based; clamping to the actual set size
/// happens later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: usize,
    pub end: Option<usize>,
}

impl FromStr for RangeSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err("empty range".to_string());
        }

        let (start_part, end_part) = match value.split_once(':') {
            Some((s, e)) => (s.trim(), Some(e.trim())),
            None => (value, None),
        };

        let start = if start_part.is_empty() {
            1
        } else {
            start_part
                .parse::<usize>()
                .map_err(|_| format!("invalid range start '{}'", start_part))?
        };
        if start == 0 {
            return Err("range is 1-based; start must be at least 1".to_string());
        }

        let end = match end_part {
            None | Some("") => None,
            Some(e) => Some(
                e.parse::<usize>()
                    .map_err(|_| format!("invalid range end '{}'", e))?,
            ),
        };

        Ok(RangeSpec { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_shapes() {
        assert_eq!("5".parse::<RangeSpec>().unwrap(), RangeSpec { start: 5, end: None });
        assert_eq!("5:9".parse::<RangeSpec>().unwrap(), RangeSpec { start: 5, end: Some(9) });
        assert_eq!(":9".parse::<RangeSpec>().unwrap(), RangeSpec { start: 1, end: Some(9) });
        assert_eq!("5:".parse::<RangeSpec>().unwrap(), RangeSpec { start: 5, end: None });
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<RangeSpec>().is_err());
        assert!("0".parse::<RangeSpec>().is_err());
        assert!("a:b".parse::<RangeSpec>().is_err());
        assert!("5:x".parse::<RangeSpec>().is_err());
    }
}
