//! Command-line configuration of the `mesh-node` binary.

use anyhow::{Context, Result, bail};

use crate::membership::types::Address;

pub const USAGE: &str = "--bind <host:port> [--seed <host:port>]... [--verbose]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub bind: Address,
    pub seeds: Vec<Address>,
    pub verbose: bool,
}

impl NodeConfig {
    /// Parses the arguments following the program name.
    ///
    /// Unknown flags are skipped so wrappers can pass their own.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();

        let mut bind: Option<Address> = None;
        let mut seeds = Vec::new();
        let mut verbose = false;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--bind" => {
                    let value = args.get(i + 1).context("--bind requires a value")?;
                    bind = Some(value.parse::<Address>().context("invalid --bind address")?);
                    i += 2;
                }
                "--seed" => {
                    let value = args.get(i + 1).context("--seed requires a value")?;
                    seeds.push(value.parse::<Address>().context("invalid --seed address")?);
                    i += 2;
                }
                "--verbose" | "-v" => {
                    verbose = true;
                    i += 1;
                }
                _ => {
                    i += 1;
                }
            }
        }

        let Some(bind) = bind else {
            bail!("--bind is required");
        };

        Ok(Self {
            bind,
            seeds,
            verbose,
        })
    }
}
