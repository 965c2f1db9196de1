//! Interface de linha de comando do jobgate baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, reconcile,
//! check-config) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

/// jobgate: controle de admissão e reconciliação de jobs do orquestrador.
#[derive(Debug, Parser)]
#[command(name = "jobgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração TOML.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Ativa logs em nível debug.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Atende webhooks e reconcilia periodicamente até ser interrompido.
    Serve,

    /// Executa uma reconciliação e imprime as contagens resultantes em JSON.
    Reconcile {
        /// Também inicia jobs para a capacidade livre.
        #[arg(long)]
        dispatch: bool,
    },

    /// Carrega e valida a configuração, depois sai.
    CheckConfig,
}
