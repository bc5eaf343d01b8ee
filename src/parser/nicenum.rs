// Codec for the pool tools' human-friendly numbers ("1.5M", "-")

const SUFFIXES: &str = "KMGTPE";

/// Decodes `<float>[KMGTPE]?` into a byte count; the suffix is a power
/// of 1024. The sentinel `-` and any malformed input decode to -1, which
/// callers treat as "unreported".
pub fn decode(s: &str) -> i64 {
    if s == "-" {
        return -1;
    }
    let mut digits = s;
    let mut shifts = 0;
    if let Some(pos) = s.find(|c| SUFFIXES.contains(c)) {
        let suffix = s.as_bytes()[pos] as char;
        shifts = match SUFFIXES.find(suffix) {
            Some(i) => i + 1,
            None => 0,
        };
        digits = &s[..pos];
    }
    let Ok(mut value) = digits.parse::<f64>() else {
        return -1;
    };
    for _ in 0..shifts {
        value *= 1024.0;
    }
    value as i64
}

/// Inverse of [`decode`]: scales down by 1024 and picks the widest
/// precision that keeps the rendered string at most 5 characters.
pub fn encode(num: i64) -> String {
    if num == -1 {
        return "-".to_string();
    }
    let mut n = num;
    let mut index = 0usize;
    while n > 1024 {
        n /= 1024;
        index += 1;
    }
    if index == 0 {
        return n.to_string();
    }
    let unit = SUFFIXES.as_bytes()[index - 1] as char;
    if num & ((1i64 << (10 * index)) - 1) == 0 {
        return format!("{n}{unit}");
    }
    let scaled = num as f64 / (1i64 << (10 * index)) as f64;
    let mut rendered = String::new();
    for precision in (0..=2).rev() {
        rendered = format!("{scaled:.precision$}{unit}");
        if rendered.len() <= 5 {
            break;
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_plain_and_suffixed_numbers() {
        assert_eq!(decode("0"), 0);
        assert_eq!(decode("512"), 512);
        assert_eq!(decode("1K"), 1024);
        assert_eq!(decode("1.5K"), 1536);
        assert_eq!(decode("1.5M"), 1572864);
        assert_eq!(decode("2G"), 2 * 1024 * 1024 * 1024);
        assert_eq!(decode("1T"), 1i64 << 40);
    }

    #[test]
    fn decode_sentinel_and_garbage() {
        assert_eq!(decode("-"), -1);
        assert_eq!(decode(""), -1);
        assert_eq!(decode("abc"), -1);
        assert_eq!(decode("K"), -1);
    }

    #[test]
    fn encode_exact_multiples_and_fractions() {
        assert_eq!(encode(-1), "-");
        assert_eq!(encode(0), "0");
        assert_eq!(encode(1024), "1024");
        assert_eq!(encode(2048), "2K");
        assert_eq!(encode(1536), "1.50K");
        assert_eq!(encode(1i64 << 30), "1G");
    }

    #[test]
    fn round_trip_up_to_display_precision() {
        for n in [
            -1,
            0,
            1,
            1024,
            (1i64 << 20) - 1,
            (1i64 << 20) + 1,
            1i64 << 30,
            i64::MAX / 1024,
        ] {
            let rendered = encode(n);
            let back = decode(&rendered);
            if n <= 1024 {
                assert_eq!(back, n, "exact for {n} via {rendered}");
            } else {
                // display precision rounding: within half a unit of the
                // rendered magnitude
                let err = (back - n).abs() as f64;
                assert!(err / (n as f64) < 0.01, "{n} -> {rendered} -> {back}");
            }
        }
    }
}
