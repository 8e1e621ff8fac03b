use clap::Parser;
use data_encoding::HEXLOWER;
use ledger_node::{
    Account, AccountSink, Blockchain, Command, Delivery, Dispatcher, LedgerError, Opt, Overlay,
    Settings, Transaction,
};
use log::{error, info, LevelFilter};
use std::process;
use std::sync::Arc;

fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::load(opt.config.as_deref())?;
    if let Some(data_dir) = opt.data_dir {
        settings.data_dir = data_dir;
    }
    run_command(opt.command, settings)
}

fn run_command(command: Command, mut settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Createchain => {
            let blockchain = Blockchain::create(settings.db_path())?;
            println!("Done! Genesis block: {}", blockchain.get_tip_hash());
        }
        Command::Printchain => {
            let blockchain = Blockchain::open(settings.db_path())?;
            for block in blockchain.iterator() {
                let block = block?;
                println!("Height: {}", block.get_height());
                println!("Pre block hash: {}", block.get_pre_block_hash());
                println!("Cur block hash: {}", block.get_hash());
                println!("Cur block Timestamp: {}", block.get_timestamp());
                for tx in block.get_transactions() {
                    println!(
                        "- Transaction {} ({} byte payload)",
                        HEXLOWER.encode(tx.get_id()),
                        tx.get_payload().len()
                    );
                }
                println!();
            }
        }
        Command::Append { payloads } => {
            let blockchain = Blockchain::open(settings.db_path())?;
            let transactions: Vec<Transaction> = payloads
                .into_iter()
                .map(|payload| Transaction::new(payload.into_bytes()))
                .collect();
            let block = blockchain.append(&transactions)?;
            println!(
                "Appended block {} at height {}",
                block.get_hash(),
                block.get_height()
            );
        }
        Command::RegisterAccount {
            address,
            public_key,
            attributes,
        } => {
            let blockchain = Blockchain::open(settings.db_path())?;
            let account = attributes
                .iter()
                .fold(Account::new(&address, &public_key)?, |account, attr| {
                    account.with_attribute(&attr.key, &attr.value)
                });
            blockchain.register_account(address.as_bytes(), &account)?;
            println!("Registered account {address}");
        }
        Command::StartNode { seeds } => {
            settings.seeds.extend(seeds);
            let blockchain = Arc::new(Blockchain::open(settings.db_path())?);
            info!(
                "Chain loaded at height {} (tip {})",
                blockchain.get_best_height()?,
                blockchain.get_tip_hash()
            );

            let overlay = start_overlay(&settings, blockchain)?;
            overlay.wait();
        }
        Command::AnnounceAccount { address, seeds } => {
            settings.seeds.extend(seeds);
            let blockchain = Arc::new(Blockchain::open(settings.db_path())?);
            let account = blockchain
                .get_account(address.as_bytes())?
                .ok_or_else(|| LedgerError::NotFound(format!("No account stored for {address}")))?;

            let overlay = start_overlay(&settings, blockchain)?;
            let deliveries = overlay.broadcast(&account)?;
            report_deliveries(&address, &deliveries);
            overlay.shutdown();
        }
        Command::AnnounceBlock { hash, seeds } => {
            settings.seeds.extend(seeds);
            let blockchain = Arc::new(Blockchain::open(settings.db_path())?);
            let block = match hash {
                Some(hash) => blockchain
                    .get_block(&hash)?
                    .ok_or_else(|| LedgerError::NotFound(format!("No block stored as {hash}")))?,
                None => blockchain.get_tip_block()?,
            };

            let overlay = start_overlay(&settings, blockchain)?;
            let deliveries = overlay.broadcast(&block)?;
            report_deliveries(
                &format!("block {} (height {})", block.get_hash(), block.get_height()),
                &deliveries,
            );
            overlay.shutdown();
        }
    }
    Ok(())
}

fn report_deliveries(what: &str, deliveries: &[Delivery]) {
    for delivery in deliveries {
        match &delivery.outcome {
            Ok(()) => println!("{}: delivered", delivery.peer),
            Err(e) => println!("{}: failed ({e})", delivery.peer),
        }
    }
    let delivered = deliveries.iter().filter(|d| d.is_delivered()).count();
    println!("Announced {what} to {delivered}/{} peer(s)", deliveries.len());
}

fn start_overlay(
    settings: &Settings,
    blockchain: Arc<Blockchain>,
) -> Result<Overlay, Box<dyn std::error::Error>> {
    let keypair = settings.load_or_create_node_key()?;
    let sink: Arc<dyn AccountSink> = blockchain;
    let dispatcher = Dispatcher::for_ledger(sink);
    let overlay = Overlay::start(
        settings.overlay_config(),
        keypair,
        Arc::new(dispatcher),
        &settings.seeds,
    )?;
    Ok(overlay)
}
