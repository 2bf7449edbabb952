use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use super::Transport;

/// 设备与服务器之间的 tcp 连接
/// 单纯的 tcp 读写管理，读使用缓冲区而非按字节从 socket 读取数据
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn readable(&mut self) -> io::Result<()> {
        self.stream.readable().await
    }

    fn read_available(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.stream.try_read_buf(buf) {
                // 对端关闭；之前读到过数据则先交出数据
                Ok(0) => {
                    return Ok(total);
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total == 0 { Err(e) } else { Ok(total) };
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        // 优雅关闭写端；失败时由调用方丢弃连接
        self.stream.shutdown().await
    }
}
