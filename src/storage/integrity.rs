//! 地图文件完整性校验（SHA1，base64 编码）

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::{debug, error};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 计算文件 SHA1 的 base64 编码
pub fn sha1_base64(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(STANDARD.encode(hasher.finalize()))
}

/// 在阻塞线程池中校验文件，不一致时删除文件
///
/// 读取失败按校验失败处理
pub async fn verify_or_remove(path: PathBuf, expected: String) -> bool {
    let result = tokio::task::spawn_blocking(move || {
        let ok = match sha1_base64(&path) {
            Ok(actual) if actual == expected => true,
            Ok(actual) => {
                error!("SHA1 校验失败 {:?}: 期望 {}, 实际 {}", path, expected, actual);
                false
            }
            Err(e) => {
                error!("SHA1 计算失败 {:?}: {}", path, e);
                false
            }
        };

        if ok {
            debug!("SHA1 校验通过: {:?}", path);
        } else if let Err(e) = std::fs::remove_file(&path) {
            error!("删除校验失败的文件 {:?} 出错: {}", path, e);
        }
        ok
    })
    .await;

    result.unwrap_or_else(|e| {
        error!("SHA1 校验任务异常: {}", e);
        false
    })
}
