use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::archive::Compressor;
use crate::config::AgentConfig;

/// Command-line arguments for the insights agent.
///
/// Flags override the YAML configuration for a single run. Mutually
/// exclusive combinations are rejected by [`Args::validate`] before any
/// work starts.
#[derive(Parser, Debug)]
#[clap(
    name = "insights-agent",
    version,
    about = "Collect system data and upload it for analysis"
)]
pub struct Args {
    /// Register this machine with the analysis service
    #[clap(long)]
    pub register: bool,

    /// Unregister this machine
    #[clap(long)]
    pub unregister: bool,

    /// Discard the stored identity and register again
    #[clap(long)]
    pub reregister: bool,

    /// Show local and remote registration status
    #[clap(long)]
    pub status: bool,

    /// Validate the removal file and print its contents
    #[clap(long)]
    pub validate: bool,

    /// Collect without contacting the service
    #[clap(long)]
    pub offline: bool,

    /// Collect and build the archive, but do not upload it
    #[clap(long)]
    pub no_upload: bool,

    /// Keep the archive after a successful upload
    #[clap(long)]
    pub keep_archive: bool,

    /// Leave the collected tree uncompressed and stop
    #[clap(long)]
    pub no_tar_file: bool,

    /// Write the finished archive to stdout (implies --no-upload)
    #[clap(long)]
    pub to_stdout: bool,

    /// Number of upload attempts
    #[clap(long)]
    pub retries: Option<usize>,

    /// Archive compression
    #[clap(long, value_enum)]
    pub compressor: Option<Compressor>,

    /// Download fresh collection rules before collecting
    #[clap(long)]
    pub update_collection_rules: bool,

    /// Skip signature verification of collection rules
    #[clap(long)]
    pub no_gpg: bool,

    /// Read the rule document and its signature as JSON from stdin
    #[clap(long)]
    pub from_stdin: bool,

    /// Read the rule document and its signature as JSON from a file
    #[clap(long)]
    pub from_file: Option<PathBuf>,

    /// Use the flat files/commands lists of the rule document
    #[clap(long)]
    pub original_style_specs: bool,

    /// Also analyze every docker image and container on this host
    #[clap(long)]
    pub container: bool,

    /// Only analyze the image or container with this id
    #[clap(long)]
    pub only: Option<String>,

    /// Analyze a filesystem already mounted at this path as an image
    #[clap(long)]
    pub mountpoint: Option<PathBuf>,

    /// Display name reported for this host
    #[clap(long)]
    pub display_name: Option<String>,

    /// Upload an existing archive and exit
    #[clap(long)]
    pub just_upload: Option<PathBuf>,

    /// Continue even without root privileges
    #[clap(long)]
    pub force: bool,

    /// Verbose logging
    #[clap(short, long)]
    pub verbose: bool,

    /// Only log errors to the terminal
    #[clap(short, long)]
    pub quiet: bool,

    /// Path to configuration YAML file
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Subcommands
    #[clap(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Path to output configuration file
        #[clap(default_value = "insights-client.yaml")]
        path: PathBuf,
    },
}

impl Args {
    /// Reject flag combinations that cannot be honored together.
    pub fn validate(&self) -> Result<()> {
        if self.from_stdin && self.from_file.is_some() {
            bail!("Can't use both --from-stdin and --from-file.");
        }
        if self.container && self.no_tar_file {
            bail!("Can't use --no-tar-file with --container.");
        }
        if self.just_upload.is_some() && (self.offline || self.no_upload) {
            bail!("Can't use --just-upload with --offline or --no-upload.");
        }
        if self.update_collection_rules && self.offline {
            bail!("Can't use --update-collection-rules with --offline.");
        }
        if self.mountpoint.is_some() && self.container {
            bail!("Can't use --mountpoint with --container.");
        }
        if self.only.is_some() && !self.container {
            bail!("--only requires --container.");
        }
        Ok(())
    }

    /// `--to-stdout` never uploads.
    pub fn skip_upload(&self) -> bool {
        self.no_upload || self.to_stdout
    }

    /// Only runs that upload need a registered machine.
    pub fn requires_registration(&self) -> bool {
        !self.offline && !self.skip_upload()
    }

    /// Fold per-run overrides into the loaded configuration.
    pub fn apply_to_config(&self, config: &mut AgentConfig) {
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(compressor) = self.compressor {
            config.compressor = compressor;
        }
        if self.display_name.is_some() {
            config.display_name = self.display_name.clone();
        }
        if self.no_gpg {
            config.gpg = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_basic_args_parsing() {
        let args = Args::parse_from(&[
            "insights-agent",
            "--offline",
            "--keep-archive",
            "--compressor", "xz",
            "--verbose",
        ]);

        assert!(args.offline);
        assert!(args.keep_archive);
        assert_eq!(args.compressor, Some(Compressor::Xz));
        assert!(args.verbose);
        assert!(!args.no_upload);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let args = Args::parse_from(&["insights-agent"]);

        assert!(args.retries.is_none());
        assert!(args.compressor.is_none());
        assert!(!args.register);
        assert!(!args.container);
        assert!(!args.force);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_conflicting_args() {
        let args = Args::parse_from(&[
            "insights-agent",
            "--from-stdin",
            "--from-file", "/tmp/rules.json",
        ]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(&["insights-agent", "--container", "--no-tar-file"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(&["insights-agent", "--just-upload", "/tmp/a.tar.gz", "--offline"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(&["insights-agent", "--only", "abc"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(&["insights-agent", "--container", "--mountpoint", "/mnt/img"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_to_stdout_implies_no_upload() {
        let args = Args::parse_from(&["insights-agent", "--to-stdout"]);
        assert!(args.skip_upload());
    }

    #[test]
    fn test_registration_only_required_for_uploads() {
        assert!(Args::parse_from(&["insights-agent"]).requires_registration());

        for flag in ["--no-upload", "--to-stdout", "--offline"] {
            let args = Args::parse_from(&["insights-agent", flag]);
            assert!(!args.requires_registration(), "{}", flag);
        }
    }

    #[test]
    fn test_apply_to_config() {
        let args = Args::parse_from(&[
            "insights-agent",
            "--retries", "3",
            "--no-gpg",
            "--display-name", "db-primary",
        ]);
        let mut config = AgentConfig::default();
        args.apply_to_config(&mut config);

        assert_eq!(config.retries, 3);
        assert!(!config.gpg);
        assert_eq!(config.display_name.as_deref(), Some("db-primary"));
    }

    #[test]
    fn test_init_config_subcommand() {
        let args = Args::parse_from(&["insights-agent", "init-config", "custom.yaml"]);

        match args.command {
            Some(Commands::InitConfig { path }) => {
                assert_eq!(path, PathBuf::from("custom.yaml"));
            }
            _ => panic!("Expected InitConfig command"),
        }
    }
}
