/// Sandbox accounting ("meta") file parsing
///
/// After every run the sandbox writes one `key:value` record per line.
/// Only the keys below are interpreted; anything else is ignored.
///
/// | key         | unit    | stored as            |
/// |-------------|---------|----------------------|
/// | `cg-mem`    | kB      | bytes (x1000)        |
/// | `exitcode`  | integer | exit code            |
/// | `exitsig`   | integer | signal name          |
/// | `message`   | text    | diagnostic message   |
/// | `status`    | text    | status code          |
/// | `time`      | seconds | CPU milliseconds     |
/// | `time-wall` | seconds | wall milliseconds    |
use nix::sys::signal::Signal;
use sandrun_common::types::Status;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountingError {
    #[error("Failed to parse metadata file, received: {0}")]
    MissingSeparator(String),
    #[error("Failed to parse metadata value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accounting {
    pub memory: Option<u64>,
    pub exit_code: Option<i32>,
    pub signal: Option<Signal>,
    pub message: Option<String>,
    pub status: Option<Status>,
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
}

impl Accounting {
    pub fn parse(text: &str) -> Result<Self, AccountingError> {
        let mut accounting = Accounting::default();

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| AccountingError::MissingSeparator(line.to_string()))?;

            match key {
                "cg-mem" => accounting.memory = Some(parse_number::<u64>(key, value)? * 1000),
                "exitcode" => accounting.exit_code = Some(parse_number(key, value)?),
                "exitsig" => {
                    let number: i32 = parse_number(key, value)?;
                    accounting.signal = Signal::try_from(number).ok();
                }
                "message" => accounting.message = Some(value.to_string()),
                "status" => accounting.status = Some(Status::from(value.to_string())),
                "time" => accounting.cpu_time_ms = Some(seconds_to_ms(key, value)?),
                "time-wall" => accounting.wall_time_ms = Some(seconds_to_ms(key, value)?),
                _ => {}
            }
        }

        Ok(accounting)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AccountingError> {
    value.trim().parse().map_err(|_| AccountingError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn seconds_to_ms(key: &str, value: &str) -> Result<u64, AccountingError> {
    let seconds: f64 = parse_number(key, value)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(AccountingError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok((seconds * 1000.0).round() as u64)
}
