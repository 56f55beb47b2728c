//! Run options: the `--key=value` store driving a fabber run.
//!
//! Options arrive from the command line (`--key=value`, boolean `--key`),
//! from parameter files (`-f <file>`, one option per line with `#`
//! comments), or from legacy whitespace-separated files (`-@ <file>`).
//! Values are stored as strings and converted on access, so model and
//! method plugins can define their own keys without a central schema.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FabberError, FabberResult};

/// The type of an option value, for help listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    /// Present/absent flag
    Bool,
    /// Free-form string
    Str,
    /// Integer
    Int,
    /// Floating-point number
    Float,
    /// Path to a file
    File,
    /// Path to a 3-D image volume
    Image,
    /// Path to a 4-D timeseries volume
    Timeseries,
    /// Path to a matrix file
    Matrix,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "BOOL",
            Self::Str => "STR",
            Self::Int => "INT",
            Self::Float => "FLOAT",
            Self::File => "FILE",
            Self::Image => "IMAGE",
            Self::Timeseries => "TIMESERIES",
            Self::Matrix => "MATRIX",
        };
        f.write_str(s)
    }
}

/// Description of one option accepted by a model, method, or the core.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    /// Option key (without the leading `--`)
    pub name: &'static str,
    /// Value type
    pub otype: OptionType,
    /// Human-readable description
    pub description: &'static str,
    /// Whether the option must be supplied
    pub required: bool,
    /// Default value, empty if none
    pub default: &'static str,
}

impl fmt::Display for OptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "--{} [{},{},{}]",
            self.name,
            self.otype,
            if self.required { "REQUIRED" } else { "NOT REQUIRED" },
            if self.default.is_empty() {
                "NO DEFAULT".to_string()
            } else {
                format!("DEFAULT={}", self.default)
            }
        )?;
        writeln!(f, "        {}", self.description)
    }
}

/// Options common to every fabber run.
pub fn core_option_specs() -> Vec<OptionSpec> {
    vec![
        OptionSpec { name: "help", otype: OptionType::Bool, description: "Print usage information. With --method or --model, display that plugin's options", required: false, default: "" },
        OptionSpec { name: "listmethods", otype: OptionType::Bool, description: "List all known inference methods", required: false, default: "" },
        OptionSpec { name: "listmodels", otype: OptionType::Bool, description: "List all known forward models", required: false, default: "" },
        OptionSpec { name: "output", otype: OptionType::Str, description: "Directory for output files (including logfile)", required: true, default: "" },
        OptionSpec { name: "overwrite", otype: OptionType::Bool, description: "Overwrite existing output. If not set, new output directories are created by appending '+' to the directory name", required: false, default: "" },
        OptionSpec { name: "method", otype: OptionType::Str, description: "Inference method to use", required: true, default: "" },
        OptionSpec { name: "model", otype: OptionType::Str, description: "Forward model to use", required: true, default: "" },
        OptionSpec { name: "data", otype: OptionType::Timeseries, description: "Single input data file", required: true, default: "" },
        OptionSpec { name: "data<n>", otype: OptionType::Timeseries, description: "Multiple data files for n=1, 2, 3...", required: false, default: "" },
        OptionSpec { name: "data-order", otype: OptionType::Str, description: "How multiple data files are combined: concatenate = one after the other, interleave = first volume from each file, then second, etc.", required: false, default: "interleave" },
        OptionSpec { name: "mask", otype: OptionType::Image, description: "Mask file. Inference is only performed where mask value > 0", required: false, default: "" },
        OptionSpec { name: "noise", otype: OptionType::Str, description: "Observation noise model (white or ar1)", required: false, default: "white" },
        OptionSpec { name: "save-model-fit", otype: OptionType::Bool, description: "Output the model prediction as a 4d volume", required: false, default: "" },
        OptionSpec { name: "save-residuals", otype: OptionType::Bool, description: "Output the residuals (difference between the data and the model prediction)", required: false, default: "" },
        OptionSpec { name: "save-mvn", otype: OptionType::Bool, description: "Output the final MVN distributions", required: false, default: "" },
        OptionSpec { name: "save-mean", otype: OptionType::Bool, description: "Output the parameter means", required: false, default: "" },
        OptionSpec { name: "save-std", otype: OptionType::Bool, description: "Output the parameter standard deviations", required: false, default: "" },
        OptionSpec { name: "save-zstat", otype: OptionType::Bool, description: "Output the parameter Zstats", required: false, default: "" },
        OptionSpec { name: "save-noise-mean", otype: OptionType::Bool, description: "Output the noise means", required: false, default: "" },
        OptionSpec { name: "save-noise-std", otype: OptionType::Bool, description: "Output the noise standard deviations", required: false, default: "" },
        OptionSpec { name: "save-free-energy", otype: OptionType::Bool, description: "Output the free energy", required: false, default: "" },
    ]
}

/// Which result volumes a run should write.
#[derive(Debug, Clone, Copy)]
pub struct SaveFlags {
    /// Parameter posterior means
    pub mean: bool,
    /// Parameter posterior standard deviations
    pub std: bool,
    /// Parameter z-statistics (mean / std)
    pub zstat: bool,
    /// Noise precision posterior mean
    pub noise_mean: bool,
    /// Noise precision posterior standard deviation
    pub noise_std: bool,
    /// Per-voxel final free energy
    pub free_energy: bool,
    /// Final posterior as a packed symmetric-matrix volume
    pub mvn: bool,
    /// Model prediction timeseries
    pub model_fit: bool,
    /// Data minus model prediction
    pub residuals: bool,
}

/// String-keyed option store for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    params: BTreeMap<String, String>,
}

fn trim(s: &str) -> &str {
    s.trim_matches(' ')
}

impl RunOptions {
    /// An empty option store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse command-line arguments (excluding the program name).
    ///
    /// Accepts `--key=value`, boolean `--key`, `-f <file>` and `-@ <file>`.
    /// Anything else is rejected.
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> FabberResult<Self> {
        let mut opts = Self::new();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_ref();
            if arg == "-f" {
                i += 1;
                let file = args.get(i).map(S::as_ref).ok_or_else(|| {
                    FabberError::invalid_option("-f", "<none>", "expected a filename after -f")
                })?;
                opts.parse_param_file(Path::new(file))?;
            } else if arg == "-@" {
                i += 1;
                let file = args.get(i).map(S::as_ref).ok_or_else(|| {
                    FabberError::invalid_option("-@", "<none>", "expected a filename after -@")
                })?;
                opts.parse_old_style_param_file(Path::new(file))?;
            } else if let Some(key) = arg.strip_prefix("--") {
                opts.add_key_equals_value(key, false)?;
            } else {
                return Err(FabberError::invalid_option(
                    arg,
                    "",
                    "option does not begin with --",
                ));
            }
            i += 1;
        }
        Ok(opts)
    }

    /// Parse a parameter file: one `--key=value` or `key=value` per line,
    /// `#` comments, surrounding whitespace stripped, blank lines ignored.
    pub fn parse_param_file(&mut self, path: &Path) -> FabberResult<()> {
        let content = fs::read_to_string(path)
            .map_err(|e| FabberError::data_load(path, format!("could not read options file: {e}")))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let exp = line.strip_prefix("--").unwrap_or(line);
            self.add_key_equals_value(exp, true)?;
        }
        Ok(())
    }

    /// Parse a legacy whitespace-separated option file. Each word must be a
    /// `--option[=value]` or a `#` comment running to end of line; `-@` is
    /// forbidden inside the file.
    pub fn parse_old_style_param_file(&mut self, path: &Path) -> FabberResult<()> {
        let content = fs::read_to_string(path)
            .map_err(|e| FabberError::data_load(path, format!("could not read -@ file: {e}")))?;
        for line in content.lines() {
            for word in line.split_whitespace() {
                if word.starts_with('#') {
                    // Comment runs to end of line
                    break;
                } else if let Some(key) = word.strip_prefix("--") {
                    self.add_key_equals_value(key, false)?;
                } else if word.starts_with("-@") {
                    return Err(FabberError::invalid_option(
                        "-@",
                        word,
                        "-@ can only be used on the command line",
                    ));
                } else {
                    return Err(FabberError::invalid_option(
                        word,
                        "",
                        format!("invalid data found in file '{}'", path.display()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Add one `key=value` (or bare `key`) expression.
    fn add_key_equals_value(&mut self, exp: &str, trim_comments: bool) -> FabberResult<()> {
        match exp.find('=') {
            Some(eq) => {
                let key = trim(&exp[..eq]).to_string();
                let mut value = &exp[eq + 1..];
                if trim_comments {
                    if let Some(hash) = value.find('#') {
                        value = &value[..hash];
                    }
                }
                let value = trim(value).to_string();
                if let Some(existing) = self.params.get(&key) {
                    return Err(FabberError::invalid_option(
                        key.clone(),
                        value,
                        format!("already has a value: {existing}"),
                    ));
                }
                self.params.insert(key, value);
            }
            None => {
                let key = trim(exp).to_string();
                if self.params.contains_key(&key) {
                    return Err(FabberError::invalid_option(
                        key,
                        "",
                        "option given more than once",
                    ));
                }
                self.params.insert(key, String::new());
            }
        }
        Ok(())
    }

    /// Set a string-valued option programmatically.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Set or clear a boolean option.
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        let key = key.into();
        if value {
            self.params.insert(key, String::new());
        } else {
            self.params.remove(&key);
        }
    }

    /// Remove an option.
    pub fn unset(&mut self, key: &str) {
        self.params.remove(key);
    }

    /// Whether the key is present at all.
    #[must_use]
    pub fn have_key(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Iterate (key, value) pairs, for logging.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A mandatory string option.
    pub fn get_str(&self, key: &str) -> FabberResult<&str> {
        match self.params.get(key) {
            None => Err(FabberError::missing_option(key)),
            Some(v) if v.is_empty() => Err(FabberError::invalid_option(
                key,
                "<no value>",
                "value must be given",
            )),
            Some(v) => Ok(v),
        }
    }

    /// A string option with a default.
    #[must_use]
    pub fn get_str_default<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.params.get(key) {
            Some(v) => v,
            None => default,
        }
    }

    /// A boolean option: present without a value.
    pub fn get_bool(&self, key: &str) -> FabberResult<bool> {
        match self.params.get(key) {
            None => Ok(false),
            Some(v) if v.is_empty() => Ok(true),
            Some(v) => Err(FabberError::invalid_option(
                key,
                v.clone(),
                "value should not be given for boolean option",
            )),
        }
    }

    /// A mandatory integer option.
    pub fn get_int(&self, key: &str) -> FabberResult<i64> {
        let v = self.get_str(key)?;
        v.parse().map_err(|_| {
            FabberError::invalid_option(key, v.to_string(), "must be an integer")
        })
    }

    /// An integer option with a default.
    pub fn get_int_default(&self, key: &str, default: i64) -> FabberResult<i64> {
        if self.have_key(key) {
            self.get_int(key)
        } else {
            Ok(default)
        }
    }

    /// A mandatory floating-point option.
    pub fn get_f64(&self, key: &str) -> FabberResult<f64> {
        let v = self.get_str(key)?;
        v.parse().map_err(|_| {
            FabberError::invalid_option(key, v.to_string(), "must be a number")
        })
    }

    /// A floating-point option with a default.
    pub fn get_f64_default(&self, key: &str, default: f64) -> FabberResult<f64> {
        if self.have_key(key) {
            self.get_f64(key)
        } else {
            Ok(default)
        }
    }

    /// Resolve (and create) the output directory.
    ///
    /// If the configured directory exists and `--overwrite` is not set, `+`
    /// is appended until a free name is found, giving up after 50 attempts.
    pub fn resolve_output_dir(&self) -> FabberResult<PathBuf> {
        let basename = self.get_str_default("output", "");
        if basename.is_empty() {
            return Ok(PathBuf::from("."));
        }
        let overwrite = self.get_bool("overwrite")?;

        let mut dir = PathBuf::from(basename);
        for _attempt in 0..50 {
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if overwrite && dir.is_dir() {
                        return Ok(dir);
                    }
                    dir = PathBuf::from(format!("{}+", dir.display()));
                }
                Err(e) => {
                    return Err(FabberError::internal(format!(
                        "cannot create output directory '{}': {e}",
                        dir.display()
                    )))
                }
            }
        }
        Err(FabberError::internal(format!(
            "cannot create output directory (bad path, or too many + signs?): {}",
            dir.display()
        )))
    }

    /// The save flags for this run, with the compatibility defaults: means,
    /// stds, zstats, noise moments, free energy and final MVN are written
    /// unless the data is unavailable; model fit and residuals are opt-in.
    pub fn save_flags(&self) -> FabberResult<SaveFlags> {
        Ok(SaveFlags {
            mean: self.get_bool("save-mean")? || !self.have_key("save-mean"),
            std: self.get_bool("save-std")? || !self.have_key("save-std"),
            zstat: self.get_bool("save-zstat")? || !self.have_key("save-zstat"),
            noise_mean: self.get_bool("save-noise-mean")? || !self.have_key("save-noise-mean"),
            noise_std: self.get_bool("save-noise-std")? || !self.have_key("save-noise-std"),
            free_energy: self.get_bool("save-free-energy")? || !self.have_key("save-free-energy"),
            mvn: self.get_bool("save-mvn")? || !self.have_key("save-mvn"),
            model_fit: self.get_bool("save-model-fit")?,
            residuals: self.get_bool("save-residuals")?,
        })
    }
}

impl fmt::Display for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.params {
            if value.is_empty() {
                writeln!(f, "--{key}")?;
            } else {
                writeln!(f, "--{key}='{value}'")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_key_value_and_boolean() {
        let opts =
            RunOptions::parse_args(&["--model=poly", "--degree=2", "--overwrite"]).unwrap();
        assert_eq!(opts.get_str("model").unwrap(), "poly");
        assert_eq!(opts.get_int("degree").unwrap(), 2);
        assert!(opts.get_bool("overwrite").unwrap());
        assert!(!opts.get_bool("save-mvn").unwrap());
    }

    #[test]
    fn test_rejects_non_option_argument() {
        assert!(RunOptions::parse_args(&["model=poly"]).is_err());
    }

    #[test]
    fn test_rejects_duplicate_key() {
        let err = RunOptions::parse_args(&["--model=poly", "--model=linear"]).unwrap_err();
        assert!(err.to_string().contains("already has a value"));
    }

    #[test]
    fn test_boolean_option_with_value_is_invalid() {
        let opts = RunOptions::parse_args(&["--overwrite=yes"]).unwrap();
        assert!(opts.get_bool("overwrite").is_err());
    }

    #[test]
    fn test_typed_getter_errors_name_the_key() {
        let opts = RunOptions::parse_args(&["--degree=two"]).unwrap();
        let err = opts.get_int("degree").unwrap_err();
        assert!(err.to_string().contains("degree"));
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn test_param_file_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# a comment line").unwrap();
        writeln!(f, "  --model=poly  ").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "--degree=3 # trailing comment").unwrap();
        drop(f);

        let opts = RunOptions::parse_args(&["-f", path.to_str().unwrap()]).unwrap();
        assert_eq!(opts.get_str("model").unwrap(), "poly");
        assert_eq!(opts.get_int("degree").unwrap(), 3);
    }

    #[test]
    fn test_old_style_param_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.fab");
        std::fs::write(&path, "--model=poly   --degree=2\n# whole line comment\n--overwrite\n")
            .unwrap();

        let opts = RunOptions::parse_args(&["-@", path.to_str().unwrap()]).unwrap();
        assert_eq!(opts.get_str("model").unwrap(), "poly");
        assert!(opts.get_bool("overwrite").unwrap());
    }

    #[test]
    fn test_old_style_file_forbids_nested_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.fab");
        std::fs::write(&path, "-@ other.fab\n").unwrap();
        assert!(RunOptions::parse_args(&["-@", path.to_str().unwrap()]).is_err());
    }

    #[test]
    fn test_output_dir_suffixing() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");

        let mut opts = RunOptions::new();
        opts.set("output", base.to_str().unwrap());

        let first = opts.resolve_output_dir().unwrap();
        assert_eq!(first, base);

        let second = opts.resolve_output_dir().unwrap();
        assert_eq!(second, PathBuf::from(format!("{}+", base.display())));

        let third = opts.resolve_output_dir().unwrap();
        assert_eq!(third, PathBuf::from(format!("{}++", base.display())));
    }

    #[test]
    fn test_output_dir_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");
        std::fs::create_dir(&base).unwrap();
        std::fs::write(base.join("stale.npy"), "x").unwrap();

        let mut opts = RunOptions::new();
        opts.set("output", base.to_str().unwrap());
        opts.set_bool("overwrite", true);
        assert_eq!(opts.resolve_output_dir().unwrap(), base);
    }

    #[test]
    fn test_save_flag_defaults() {
        let opts = RunOptions::new();
        let flags = opts.save_flags().unwrap();
        assert!(flags.mean && flags.std && flags.zstat);
        assert!(flags.noise_mean && flags.noise_std);
        assert!(flags.free_energy && flags.mvn);
        assert!(!flags.model_fit && !flags.residuals);
    }
}
