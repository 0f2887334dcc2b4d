#[macro_use]
extern crate log;

use std::{env, process, time::Duration};

use anyhow::{Error, Result};
use expanduser::expanduser;
use tokio::{signal, spawn, sync::mpsc};

use crate::{
    config::Config, identity::ShareId, metainfo::Metainfo, session::Session, store::FileStore,
};

mod config;
mod dht;
mod identity;
mod message;
mod metainfo;
mod peer;
mod session;
mod store;
mod tracker;

const USAGE: &str = "usage: bitshare <torrent file | http url | magnet uri>";

#[tokio::main]
async fn main() {
    if let Err(e) = try_main().await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let arg = match env::args().nth(1) {
        Some(arg) if arg == "-help" || arg == "--help" => {
            println!("{USAGE}");
            return Ok(());
        }
        Some(arg) => arg,
        _ => return Err(Error::msg(USAGE)),
    };

    let config = Config {
        port: 6881,
        dir: expanduser("~/.bitshare")?,
        store_root: "download".into(),
        target_peers: 15,
        peer_connect_timeout: Duration::from_secs(4),
        peer_idle_cutoff: Duration::from_secs(180),
        dht_chunk: 100,
        dht_min_peers: 50,
    };

    let metainfo = Metainfo::from_source(&arg).await?;
    info!("info hash: {}", hex::encode(metainfo.info_hash));

    if let Some(info) = &metainfo.info {
        let mut store = FileStore::new(info, &config.store_root)?;
        let good = store.check_pieces(info)?;
        let have = good.iter().filter(|g| **g).count();
        info!("{}/{} pieces verified", have, good.len());
        if have == good.len() && !good.is_empty() {
            store.cleanup()?;
        }
    }

    let share = ShareId::new(metainfo.info_hash);
    let announce_urls = metainfo.announce_urls();
    let (mut session, mut torrents) = Session::new(share, announce_urls, config.clone())?;
    if metainfo.info.is_some() {
        metainfo.save(&config.dir)?;
    }
    if session.current() != Some(metainfo.info_hash) {
        session.set_current(metainfo.info_hash)?;
    }

    let (quit_tx, quit_rx) = mpsc::channel(1);
    let mut session_h = spawn(session.run(quit_rx));

    loop {
        tokio::select! {
            Some(announce) = torrents.recv() => {
                info!(
                    "swarm revision announced: {} via {}",
                    hex::encode(announce.info_hash),
                    announce.peer
                );
            }
            res = &mut session_h => return res?,
            _ = signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    let _ = quit_tx.send(()).await;
    session_h.await??;
    Ok(())
}
