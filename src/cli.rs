//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--verbose`) and one
//! [`Command`] per control operation of the engine.

use std::path::PathBuf;

use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::job::{Delays, MessageBlock};

/// wadispatch: sequential WhatsApp sends and remote number verification.
#[derive(Debug, Parser)]
#[command(name = "wadispatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the config file (defaults to ./wadispatch.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    /// Parse the process arguments, keeping the order of `send` blocks.
    pub fn parse_args() -> Self {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches).unwrap_or_else(|e| e.exit())
    }

    pub fn try_parse_args_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self, clap::Error> {
        let mut cli = Self::from_arg_matches(matches)?;
        if let (Command::Send(args), Some(("send", sub))) = (&mut cli.command, matches.subcommand()) {
            args.record_order(sub);
        }
        Ok(cli)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send message blocks to one destination, in order.
    Send(SendArgs),

    /// Check which numbers are on WhatsApp using the remote verifier.
    Verify {
        /// Outbound instance(s) used by the verifier.
        #[arg(long = "channel", required = true)]
        channels: Vec<String>,

        /// Numbers to check.
        #[arg(required = true)]
        numbers: Vec<String>,

        /// Delay between two numbers on the server side.
        #[arg(long, default_value_t = 1_000)]
        delay_ms: u64,

        /// Return right after the job is created.
        #[arg(long)]
        detach: bool,
    },

    /// List every job in the ledger.
    List,

    /// Show one job as JSON.
    Show { id: String },

    Pause { id: String },

    Resume { id: String },

    Cancel {
        id: String,

        /// Finalize a local job whose owning process is gone.
        #[arg(long)]
        force: bool,
    },

    /// Remove a finished job.
    Remove { id: String },

    /// Remove every finished job.
    Clear,

    /// Follow live job changes until Ctrl-C.
    Watch {
        /// Only show this job.
        id: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Destination phone number.
    #[arg(long)]
    pub to: String,

    /// Outbound instance.
    #[arg(long)]
    pub channel: String,

    /// Text block; repeat for several blocks.
    #[arg(long = "text")]
    pub texts: Vec<String>,

    /// Image block as URL, optionally `URL|caption`.
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Video block as URL, optionally `URL|caption`.
    #[arg(long = "video")]
    pub videos: Vec<String>,

    /// Audio block URL.
    #[arg(long = "audio")]
    pub audios: Vec<String>,

    /// Document block as URL, optionally `URL|file name`.
    #[arg(long = "document")]
    pub documents: Vec<String>,

    /// Wait before the first block (overrides config).
    #[arg(long)]
    pub start_delay_ms: Option<u64>,

    /// Wait between blocks (overrides config).
    #[arg(long)]
    pub step_delay_ms: Option<u64>,

    /// Command-line order of the block flags as (kind, nth value of that kind).
    #[arg(skip)]
    order: Vec<(BlockFlag, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockFlag {
    Text,
    Image,
    Video,
    Audio,
    Document,
}

const BLOCK_FLAGS: [(&str, BlockFlag); 5] = [
    ("texts", BlockFlag::Text),
    ("images", BlockFlag::Image),
    ("videos", BlockFlag::Video),
    ("audios", BlockFlag::Audio),
    ("documents", BlockFlag::Document),
];

impl SendArgs {
    /// Blocks in the order they were given on the command line. Without
    /// recorded positions they come grouped by kind.
    pub fn blocks(&self) -> Vec<MessageBlock> {
        let order = if self.order.is_empty() {
            self.kind_order()
        } else {
            self.order.clone()
        };
        order
            .into_iter()
            .filter_map(|(flag, nth)| self.block(flag, nth))
            .collect()
    }

    fn record_order(&mut self, matches: &ArgMatches) {
        let mut positioned = Vec::new();
        for (id, flag) in BLOCK_FLAGS {
            if let Some(indices) = matches.indices_of(id) {
                positioned.extend(indices.enumerate().map(|(nth, at)| (at, flag, nth)));
            }
        }
        positioned.sort_by_key(|(at, ..)| *at);
        self.order = positioned.into_iter().map(|(_, flag, nth)| (flag, nth)).collect();
    }

    fn kind_order(&self) -> Vec<(BlockFlag, usize)> {
        let counts = [
            (BlockFlag::Text, self.texts.len()),
            (BlockFlag::Image, self.images.len()),
            (BlockFlag::Video, self.videos.len()),
            (BlockFlag::Audio, self.audios.len()),
            (BlockFlag::Document, self.documents.len()),
        ];
        counts
            .into_iter()
            .flat_map(|(flag, count)| (0..count).map(move |nth| (flag, nth)))
            .collect()
    }

    fn block(&self, flag: BlockFlag, nth: usize) -> Option<MessageBlock> {
        let block = match flag {
            BlockFlag::Text => MessageBlock::text(self.texts.get(nth)?),
            BlockFlag::Image => {
                let (url, caption) = split_extra(self.images.get(nth)?);
                MessageBlock::Image { url, caption }
            }
            BlockFlag::Video => {
                let (url, caption) = split_extra(self.videos.get(nth)?);
                MessageBlock::Video { url, caption }
            }
            BlockFlag::Audio => MessageBlock::Audio {
                url: self.audios.get(nth)?.clone(),
            },
            BlockFlag::Document => {
                let (url, file_name) = split_extra(self.documents.get(nth)?);
                MessageBlock::Document {
                    url,
                    file_name,
                    caption: None,
                }
            }
        };
        Some(block)
    }

    /// Delay overrides merged over `defaults`; `None` when neither is given.
    pub fn delays(&self, defaults: Delays) -> Option<Delays> {
        if self.start_delay_ms.is_none() && self.step_delay_ms.is_none() {
            return None;
        }
        Some(Delays::new(
            self.start_delay_ms.unwrap_or(defaults.start_ms),
            self.step_delay_ms.unwrap_or(defaults.step_ms),
        ))
    }
}

fn split_extra(raw: &str) -> (String, Option<String>) {
    match raw.split_once('|') {
        Some((url, extra)) if !extra.trim().is_empty() => {
            (url.trim().to_string(), Some(extra.trim().to_string()))
        }
        Some((url, _)) => (url.trim().to_string(), None),
        None => (raw.trim().to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_send_subcommand() {
        let cli = Cli::parse_from([
            "wadispatch",
            "send",
            "--to",
            "5511987654321",
            "--channel",
            "inst-1",
            "--text",
            "hello",
            "--image",
            "https://cdn.example/a.png|look",
            "--step-delay-ms",
            "500",
        ]);
        let Command::Send(args) = cli.command else {
            panic!("expected Send command");
        };
        assert_eq!(args.to, "5511987654321");
        assert_eq!(
            args.blocks(),
            vec![
                MessageBlock::text("hello"),
                MessageBlock::Image {
                    url: "https://cdn.example/a.png".into(),
                    caption: Some("look".into()),
                },
            ]
        );
        assert_eq!(args.delays(Delays::new(1_000, 2_000)), Some(Delays::new(1_000, 500)));
    }

    #[test]
    fn send_blocks_keep_command_line_order() {
        let cli = Cli::try_parse_args_from([
            "wadispatch",
            "send",
            "--to",
            "5511987654321",
            "--channel",
            "inst-1",
            "--image",
            "https://x/a.png",
            "--text",
            "caption for the image above",
            "--document",
            "https://x/b.pdf|b.pdf",
            "--text",
            "bye",
        ])
        .unwrap();
        let Command::Send(args) = cli.command else {
            panic!("expected Send command");
        };
        let kinds: Vec<&str> = args.blocks().iter().map(MessageBlock::content_type).collect();
        assert_eq!(kinds, vec!["image", "text", "document", "text"]);
        assert_eq!(args.blocks()[3], MessageBlock::text("bye"));
    }

    #[test]
    fn send_without_overrides_uses_config_delays() {
        let cli = Cli::parse_from(["wadispatch", "send", "--to", "1", "--channel", "c"]);
        let Command::Send(args) = cli.command else {
            panic!("expected Send command");
        };
        assert!(args.blocks().is_empty());
        assert_eq!(args.delays(Delays::default()), None);
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["wadispatch", "--config", "alt.toml", "--verbose", "list"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn cli_parses_verify_and_cancel() {
        let cli = Cli::parse_from([
            "wadispatch",
            "verify",
            "--channel",
            "inst-1",
            "--channel",
            "inst-2",
            "5511",
            "5522",
        ]);
        match cli.command {
            Command::Verify {
                channels,
                numbers,
                delay_ms,
                detach,
            } => {
                assert_eq!(channels, vec!["inst-1", "inst-2"]);
                assert_eq!(numbers, vec!["5511", "5522"]);
                assert_eq!(delay_ms, 1_000);
                assert!(!detach);
            }
            _ => panic!("expected Verify command"),
        }

        let cli = Cli::parse_from(["wadispatch", "cancel", "cli-1-abc", "--force"]);
        assert!(matches!(cli.command, Command::Cancel { force: true, .. }));
    }

    #[test]
    fn document_file_name_is_optional() {
        assert_eq!(
            split_extra("https://x/a.pdf|report.pdf"),
            ("https://x/a.pdf".to_string(), Some("report.pdf".to_string()))
        );
        assert_eq!(split_extra("https://x/a.pdf|"), ("https://x/a.pdf".to_string(), None));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
