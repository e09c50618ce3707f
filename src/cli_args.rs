//! `--flag value` / `--flag=value` parsing shared by the binaries.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    args: Vec<String>,
}

impl CliArgs {
    pub fn from_env() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
        }
    }

    pub fn from_vec<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Last non-empty value given for `flag` (e.g. `"--seed"`).
    pub fn value(&self, flag: &str) -> Option<String> {
        let prefix = format!("{flag}=");
        let mut found = None;
        for (idx, arg) in self.args.iter().enumerate() {
            if let Some(v) = arg.strip_prefix(&prefix) {
                if !v.trim().is_empty() {
                    found = Some(v.trim().to_string());
                }
                continue;
            }
            if arg == flag
                && let Some(next) = self.args.get(idx + 1)
                && !next.trim().is_empty()
                && !next.starts_with("--")
            {
                found = Some(next.trim().to_string());
            }
        }
        found
    }

    pub fn path(&self, flag: &str) -> Option<PathBuf> {
        self.value(flag).map(PathBuf::from)
    }

    pub fn parsed<T>(&self, flag: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.value(flag) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("invalid value `{raw}` for {flag}: {e}")),
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

#[cfg(test)]
mod tests {
    use super::CliArgs;

    #[test]
    fn reads_both_flag_forms() {
        let args = CliArgs::from_vec(["--seed", "7", "--train-ratio=0.75", "--verbose"]);
        assert_eq!(args.parsed::<u64>("--seed").expect("seed"), Some(7));
        assert_eq!(args.parsed::<f64>("--train-ratio").expect("ratio"), Some(0.75));
        assert!(args.has_flag("--verbose"));
        assert_eq!(args.value("--out"), None);
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let args = CliArgs::from_vec(["--min-rows", "many"]);
        assert!(args.parsed::<usize>("--min-rows").is_err());
    }

    #[test]
    fn negative_values_are_not_taken_for_flags() {
        let args = CliArgs::from_vec(["--temperature", "-500"]);
        assert_eq!(args.parsed::<f64>("--temperature").expect("temp"), Some(-500.0));
    }
}
