use std::{
    error::Error,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{debug, error, info};

use device::{BlockFile, MemDevice};
use fs::{compute_layout, BlockCache, BlockDevice, CacheStats, FileSystem, MountConfig, BLOCK_SIZE};

mod device;
mod fs;
mod logging;

fn main() {
    if let Err(e) = bench() {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn cli() -> Command {
    Command::new("logfs-bench")
        .about("Benchmark the block cache, the write-ahead log and the layout planner")
        .arg(
            Arg::new("image")
                .short('i')
                .long("image")
                .default_value("disk.img")
                .help("Disk image to create (ignored with --memory)"),
        )
        .arg(
            Arg::new("memory")
                .short('m')
                .long("memory")
                .action(ArgAction::SetTrue)
                .help("Use an in-memory disk instead of an image file"),
        )
        .arg(
            Arg::new("keep")
                .short('k')
                .long("keep")
                .action(ArgAction::SetTrue)
                .help("Reuse an existing disk image instead of creating a new one"),
        )
        .arg(count_arg("data-bitmaps", "1", "Number of data bitmap blocks"))
        .arg(count_arg("inode-bitmaps", "1", "Number of inode bitmap blocks"))
        .arg(count_arg("log-descr-blocks", "256", "Number of log descriptor blocks"))
        .arg(count_arg("cache-size", "100000", "Block cache capacity in blocks"))
        .arg(count_arg("iters", "1000000", "Number of iterations"))
        .arg(
            Arg::new("op")
                .short('o')
                .long("op")
                .value_parser(["cache-read", "cache-write", "cache-sync", "log-read", "layout"])
                .default_value("log-read")
                .help("Operation to benchmark"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .default_value("info")
                .help("error, warn, info, debug, trace or off"),
        )
}

fn count_arg(name: &'static str, default: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(value_parser!(usize))
        .default_value(default)
        .help(help)
}

fn count_of(matches: &ArgMatches, name: &str) -> usize {
    matches.get_one::<usize>(name).copied().unwrap_or_default()
}

fn str_of<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches.get_one::<String>(name).map(String::as_str).unwrap_or_default()
}

/// 执行 iters 次 f, 返回总耗时
fn time_loop(iters: usize, mut f: impl FnMut() -> fs::Result<()>) -> fs::Result<Duration> {
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed())
}

fn report_cache(stats: CacheStats) {
    info!(
        "cache: {} hits, {} misses, {} evictions, {} writebacks",
        stats.hits, stats.misses, stats.evictions, stats.writebacks
    );
}

fn bench() -> Result<(), Box<dyn Error>> {
    let matches = cli().get_matches();
    logging::init(str_of(&matches, "log-level"));

    let config = MountConfig {
        data_bitmaps: count_of(&matches, "data-bitmaps"),
        inode_bitmaps: count_of(&matches, "inode-bitmaps"),
        log_descr_blocks: count_of(&matches, "log-descr-blocks"),
        cache_size: count_of(&matches, "cache-size"),
    };
    let iters = count_of(&matches, "iters");
    let op = str_of(&matches, "op");
    let layout = config.layout()?;
    for region in layout.regions().iter() {
        debug!("region {:?}", region);
    }

    // 创建虚拟块设备, 容量恰好为布局需要的块数
    let block_device: Arc<dyn BlockDevice> = if matches.get_flag("memory") {
        Arc::new(MemDevice::new(layout.max_addr))
    } else {
        let path = str_of(&matches, "image");
        if matches.get_flag("keep") {
            info!("opening {}", path);
            Arc::new(BlockFile::open(path)?)
        } else {
            info!(
                "creating {} with {} blocks of {} bytes",
                path, layout.max_addr, BLOCK_SIZE
            );
            Arc::new(BlockFile::create(path, layout.max_addr)?)
        }
    };

    // 读写的目标块: inode 区域的第一个块
    let block_id = layout.inode_base;
    if let Some(region) = layout.regions().iter().find(|r| r.contains(block_id)) {
        debug!("target block {} in {:?}", block_id, region);
    }
    let block = [0u8; BLOCK_SIZE];

    let elapsed = match op {
        "layout" => time_loop(iters, || {
            std::hint::black_box(compute_layout(
                config.data_bitmaps,
                config.inode_bitmaps,
                config.log_descr_blocks,
            )?);
            Ok(())
        })?,
        "cache-read" | "cache-write" | "cache-sync" => {
            let mut cache = BlockCache::new(block_device, config.cache_size);
            let elapsed = time_loop(iters, || match op {
                "cache-read" => cache.read(block_id).map(|_| ()),
                "cache-write" => cache.write(block_id, &block),
                _ => {
                    cache.write(block_id, &block)?;
                    cache.sync(block_id)
                }
            })?;
            cache.sync_all()?;
            report_cache(cache.stats());
            elapsed
        }
        _ => {
            let fs = FileSystem::mount(block_device, config)?;
            let mut fs = fs.lock();
            debug!("recovery: {:?}, log state {:?}", fs.recovery(), fs.txn_state());
            let elapsed = time_loop(iters, || fs.log_read(block_id).map(|_| ()))?;
            fs.sync()?;
            report_cache(fs.cache_stats());
            elapsed
        }
    };

    let per_iter = elapsed.as_nanos() / iters.max(1) as u128;
    info!("{}: {} iterations in {:?}", op, iters, elapsed);
    info!("Took {}ns per iteration", per_iter);
    Ok(())
}
