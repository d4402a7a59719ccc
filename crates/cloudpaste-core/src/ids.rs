use rand::RngExt as _;
use time::OffsetDateTime;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 6;

/// Task identifier: `<type>-YYMMDDHHMM-<rand6>`.
pub fn task_id(task_type: &str) -> String {
    let now = OffsetDateTime::now_utc();
    let stamp = format!(
        "{:02}{:02}{:02}{:02}{:02}",
        now.year().rem_euclid(100),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute()
    );

    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.random_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();

    format!("{task_type}-{stamp}-{suffix}")
}

/// Current time as unix epoch milliseconds (task-table timestamps).
pub fn epoch_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Current time as unix epoch seconds (everything else).
pub fn epoch_s() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_shape() {
        let id = task_id("copy");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "copy");
        assert_eq!(parts[1].len(), 10);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 6);
        assert!(
            parts[2]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn epoch_ms_tracks_epoch_s() {
        let ms = epoch_ms();
        let s = epoch_s();
        assert!((ms / 1000 - s).abs() <= 1);
    }
}
