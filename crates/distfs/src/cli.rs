use clap::Parser;
use std::path::PathBuf;

use crate::config::DistFsConfig;

/// distfs command line arguments.
#[derive(Parser, Debug)]
#[command(name = "distfs")]
#[command(about = "Read-only FUSE mirror of a directory with filtered file content", long_about = None)]
pub struct Cli {
    /// Directory to mirror.
    pub source: PathBuf,

    /// Where to mount the mirror.
    pub mountpoint: PathBuf,

    /// TOML or JSON config file.
    #[arg(short, long, env = "DISTFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Filter program and its arguments; `{path}` is replaced by the source path.
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "CMD")]
    pub filter_cmd: Vec<String>,

    /// Only filter files with this extension. Repeatable.
    #[arg(long = "ext", value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Allow other users to access the mount.
    #[arg(long)]
    pub allow_other: bool,
}

impl Cli {
    /// Load the config file, if any, and apply command-line overrides.
    pub fn load_config(&self) -> anyhow::Result<DistFsConfig> {
        let mut config = match &self.config {
            Some(path) => DistFsConfig::from_file(path)?,
            None => DistFsConfig::default(),
        };
        if !self.filter_cmd.is_empty() {
            config.filter.command = self.filter_cmd.clone();
        }
        if !self.extensions.is_empty() {
            config.filter.extensions = self.extensions.clone();
        }
        if self.allow_other {
            config.mount.allow_other = true;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_positionals() {
        let cli = Cli::parse_from(["distfs", "/srv/app", "/mnt/app"]);
        assert_eq!(cli.source, PathBuf::from("/srv/app"));
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt/app"));
        assert!(cli.filter_cmd.is_empty());
        assert!(!cli.allow_other);
    }

    #[test]
    fn test_cli_missing_mountpoint_is_error() {
        assert!(Cli::try_parse_from(["distfs", "/srv/app"]).is_err());
        assert!(Cli::try_parse_from(["distfs"]).is_err());
    }

    #[test]
    fn test_cli_filter_flags() {
        let cli = Cli::parse_from([
            "distfs",
            "--ext",
            "js",
            "--ext",
            "ts",
            "--allow-other",
            "/srv/app",
            "/mnt/app",
            "--filter-cmd",
            "esbuild",
            "--minify",
        ]);
        assert_eq!(cli.filter_cmd, vec!["esbuild", "--minify"]);
        assert_eq!(cli.extensions, vec!["js", "ts"]);
        assert!(cli.allow_other);
    }

    #[test]
    fn test_load_config_defaults() {
        let cli = Cli::parse_from(["distfs", "/a", "/b"]);
        assert_eq!(cli.load_config().unwrap(), DistFsConfig::default());
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[filter]
command = ["cat"]
extensions = ["md"]
"#
        )
        .unwrap();
        let config_path = file.path().display().to_string();

        let cli = Cli::parse_from([
            "distfs",
            "--config",
            &config_path,
            "--ext",
            "js",
            "--allow-other",
            "/a",
            "/b",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.filter.command, vec!["cat"]);
        assert_eq!(config.filter.extensions, vec!["js"]);
        assert!(config.mount.allow_other);
    }
}
