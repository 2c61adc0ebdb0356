use anyhow::{bail, Context};
use map_downloader::{config::AppConfig, logging, Callbacks, DownloadContext, DownloadStatus};
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

fn usage() -> ! {
    eprintln!("用法: map-downloader <目标文件> <文件大小> <镜像URL>...");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        usage();
    }
    let file_path = &args[0];
    let file_size: u64 = args[1]
        .parse()
        .with_context(|| format!("无效的文件大小: {}", args[1]))?;
    let urls = args[2..].to_vec();

    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 🔥 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Map Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let context = DownloadContext::new(config.download.clone())?;

    // 每前进 5% 输出一次
    let mut last_step = None;
    let callbacks = Callbacks::new().on_progress(move |progress| {
        let Some(percent) = progress.percent() else {
            return;
        };
        let step = (percent / 5.0) as u64;
        if last_step != Some(step) {
            last_step = Some(step);
            info!("下载进度: {:.1}% ({} 字节)", percent, progress.downloaded);
        }
    });

    let mut handle = context
        .get_file(urls, file_path, file_size, callbacks)
        .await
        .context("启动下载失败")?;

    let mut snapshots = handle.subscribe();
    let interrupted = tokio::select! {
        _ = snapshots.wait_for(|s| s.status.is_terminal()) => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    let snapshot = if interrupted {
        info!("收到 Ctrl+C，取消下载...");
        handle.cancel().await
    } else {
        handle.wait().await
    };

    let status = snapshot.status.public();
    println!("{}: {}", file_path, status);
    info!("下载结束: {}, 续传记录保存 {} 次", status, snapshot.resume_saves);

    if status != DownloadStatus::Completed {
        warn!("文件未下载完成: {}", file_path);
        bail!("下载失败: {}", status);
    }
    Ok(())
}
