use crate::client::{ClientConfig, ClientWallet, InProcessApi};
use crate::config::{dev_federation, genesis_value_parser, FederationSpec, MemberSecrets};
use crate::consensus::MemberId;
use crate::ln::{HttpLightningClient, LightningClient};
use crate::member::{run_consensus, Member};
use crate::store::EpochStore;
use bridge::{stream_blocks, BitcoinCore, ChainQuery, PegInProof, Tree};
use clap::builder::ArgPredicate;
use clap::Parser;
use eyre::Result;
use futures::{pin_mut, StreamExt};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{future::Future, sync::Arc};
use tokio::sync::{mpsc, Mutex};
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

pub const DEFAULT_ROOT_DIR: &str = "./data/mint";

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

pub fn secrets_value_parser(s: &str) -> Result<MemberSecrets, eyre::Error> {
    let raw = std::fs::read_to_string(PathBuf::from(s))?;
    Ok(serde_json::from_str(&raw)?)
}

#[derive(Parser)]
#[command(author, about = "MINTD", long_about = None)]
pub struct App {
    #[arg(
        long = "chain",
        value_name = "CHAIN_OR_PATH",
        value_parser = genesis_value_parser,
        default_value_if("dev", ArgPredicate::IsPresent, Some("dev")),
        required_unless_present = "dev"
    )]
    chain_spec: Option<FederationSpec>,

    /// Which federation member this process acts as
    #[arg(long = "member-index", default_value_t = 0)]
    pub member_index: MemberId,

    /// Path to this member's secret key material (JSON)
    #[arg(long = "secrets", value_parser = secrets_value_parser)]
    pub secrets: Option<MemberSecrets>,

    #[arg(long = "db-path")]
    pub db_path: Option<String>,

    /// Run the whole deterministic dev federation inside this process
    #[arg(long)]
    pub dev: bool,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    #[arg(long, default_value_t = 3000)]
    pub rpc_port: u16,

    #[clap(
        long,
        env = "BITCOIN_RPC_URL",
        default_value_if("dev", ArgPredicate::IsPresent, Some("http://0.0.0.0:18443")),
    )]
    pub bitcoin_rpc_url: Option<String>,

    #[clap(
        long,
        env = "BITCOIN_RPC_USER",
        default_value_if("dev", ArgPredicate::IsPresent, Some("rpcuser")),
    )]
    pub bitcoin_rpc_user: Option<String>,

    #[clap(
        long,
        env = "BITCOIN_RPC_PASS",
        default_value_if("dev", ArgPredicate::IsPresent, Some("rpcpassword")),
    )]
    pub bitcoin_rpc_pass: Option<String>,

    /// Pay endpoint of this member's lightning node; set to act as the
    /// federation gateway
    #[clap(long, env = "GATEWAY_LN_URL")]
    pub gateway_ln_url: Option<String>,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap();

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag =
                format!("mintd={rust_log_level},bridge={rust_log_level},ecash={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    async fn execute(self) -> Result<()> {
        let spec = self.chain_spec.expect("Federation spec is configured");
        let epoch_duration = Duration::from_millis(spec.epoch_duration);
        let root_dir = self.db_path.unwrap_or(DEFAULT_ROOT_DIR.to_string());

        let bitcoin = BitcoinCore::new(
            &self.bitcoin_rpc_url.expect("RPC URL is configured"),
            self.bitcoin_rpc_user.expect("RPC user is configured"),
            self.bitcoin_rpc_pass.expect("RPC password is configured"),
        )?;
        let chain: Arc<dyn ChainQuery> = Arc::new(bitcoin.clone());

        info!("Using bitcoin deposit address {}", spec.descriptor().deposit_address);

        // with --dev every member runs inside this process, wired through
        // in-memory channels; otherwise this process is a single member and
        // the transport feeds its inbox
        let member_secrets: Vec<(MemberId, MemberSecrets)> = if self.dev {
            dev_federation()
                .1
                .into_iter()
                .enumerate()
                .map(|(id, secrets)| (id as MemberId, secrets))
                .collect()
        } else {
            let secrets = self.secrets.expect("Member secrets are configured");
            vec![(self.member_index, secrets)]
        };

        let mut senders = Vec::new();
        let mut inboxes = Vec::new();
        for _ in &member_secrets {
            let (sender, inbox) = mpsc::unbounded_channel();
            senders.push(sender);
            inboxes.push(inbox);
        }

        // only the member this process fronts acts as the gateway
        let gateway_ln: Option<Arc<dyn LightningClient>> = self
            .gateway_ln_url
            .map(|url| Arc::new(HttpLightningClient::new(url)) as Arc<dyn LightningClient>);

        let mut members = Vec::new();
        for (position, ((id, secrets), inbox)) in
            member_secrets.into_iter().zip(inboxes).enumerate()
        {
            let member_dir = format!("{root_dir}/member-{id}");
            let wallet_db = open_wallet_db(&format!("{member_dir}/wallet"))?;
            let store = EpochStore::open(&format!("{member_dir}/epochs"))
                .map_err(|e| eyre::eyre!("could not open epoch store: {e:?}"))?;
            store
                .check_spec(&spec)
                .map_err(|e| eyre::eyre!("stored federation spec does not match: {e:?}"))?;

            let ln = if id == self.member_index {
                gateway_ln.clone()
            } else {
                None
            };
            let mut member = Member::new(
                id,
                spec.clone(),
                secrets,
                wallet_db,
                store,
                chain.clone(),
                ln,
            );
            member
                .replay()
                .map_err(|e| eyre::eyre!("replay failed: {e:?}"))?;

            let member = Arc::new(Mutex::new(member));
            let peers: Vec<_> = senders
                .iter()
                .enumerate()
                .filter(|(peer, _)| *peer != position)
                .map(|(_, sender)| sender.clone())
                .collect();
            tokio::spawn(run_consensus(
                member.clone(),
                inbox,
                peers,
                epoch_duration,
            ));
            members.push(member);
        }
        // inboxes stay open for the life of the process
        let _senders = senders;

        let member = members[self.member_index as usize % members.len()].clone();
        let wallet = Arc::new(Mutex::new(ClientWallet::new(
            InProcessApi(member.clone()),
            ClientConfig::from(&spec),
        )));

        // start json-rpc v1 server
        crate::rpc::run_server(member, wallet, self.rpc_port).await;

        crate::metrics::start_server(self.metrics_port).await;

        // tail the chain and log deposits to the federation address so
        // operators can see incoming peg-ins before clients claim them
        let deposit_script = spec.descriptor().deposit_script();
        let start_height = chain
            .block_height()?
            .saturating_sub(spec.finality_confirmations);
        info!("Watching for deposits from height {}", start_height);
        let mut blocks =
            stream_blocks(bitcoin, start_height, spec.finality_confirmations).await;
        while let Some(next) = blocks.next().await {
            let (block, height) = next?;
            for transaction in &block.txdata {
                if let Some(vout) = PegInProof::find_deposit_output(transaction, &deposit_script)
                {
                    info!(
                        "deposit {}:{} confirmed in block {}",
                        transaction.txid(),
                        vout,
                        height
                    );
                }
            }
        }

        Ok(())
    }
}

fn open_wallet_db(path: &str) -> Result<Tree> {
    let db = bridge::sled::open(path)?;
    Ok(db.open_tree("wallet")?)
}

// async code taken from reth, when we add more complexity we should adopt
// the task manager logic to handle thread spawning and graceful shutdown
pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
