//! 网络层
//! 本层只关心字节的读写，不包含任何协议相关逻辑

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;

pub use conn::TcpTransport;

pub(crate) mod conn;
pub mod packet;

/// 传输层抽象
/// 会话核心通过它读写字节，具体连接（tcp、tls 等）由实现方提供
#[async_trait]
pub trait Transport: Send + 'static {
    /// 等待传输层出现可读数据（或对端关闭）
    async fn readable(&mut self) -> io::Result<()>;

    /// 非阻塞地取走当前已缓冲的全部字节，追加到 buf
    ///
    /// * `Ok(n)` n > 0：取到 n 个字节
    /// * `Ok(0)`：对端已关闭（end-of-stream）
    /// * `Err(WouldBlock)`：当前没有可读数据
    fn read_available(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// 写入字节。返回 Ok 即表示传输层已接受这批字节，不保证已刷到对端
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// 关闭连接。实现方应优先使用最优雅的关闭方式，
    /// 失败时调用方会直接丢弃连接（硬关闭）
    async fn shutdown(&mut self) -> io::Result<()>;
}
