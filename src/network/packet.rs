use std::sync::Arc;

use bytes::{Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
}

/// 服务质量
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::InvalidQoS(other)),
        }
    }
}

/// 消息来源（集群内发出此消息的 broker 节点）
/// counter 在单个节点内单调递增，用于跨节点去重
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub broker_id: String,
    pub counter: u64,
}

/// 一条应用消息
#[derive(Debug, Clone)]
pub struct Message {
    /// 主题
    pub topic: String,
    /// 消息负载
    pub payload: Bytes,
    /// 发布时的服务质量
    pub qos: QoS,
    /// 消息保留
    pub retain: bool,
    /// 集群来源，本节点发布的消息为 None
    pub origin: Option<Origin>,
}

/// 发给订阅端的 publish 报文
/// 负载与原始 publish 共享，不复制
#[derive(Debug, Clone)]
pub struct Publish {
    /// 是否重新投递
    pub dup: bool,
    /// 投递的服务质量（可能低于消息本身的 QoS）
    pub qos: QoS,
    /// QoS >= 1 时必有，在本会话的在途投递中唯一
    pub packet_id: Option<u16>,
    pub message: Arc<Message>,
}

#[derive(Debug, Clone)]
pub struct SubscribeFilter {
    pub filter: String,
    pub qos: QoS,
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub subscriptions: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub unsubscriptions: Vec<String>,
}

/// 协议报文
/// 会话核心不解释报文内容，只负责分发给外部处理器
#[derive(Debug, Clone)]
pub enum Packet {
    Connect {
        client_id: String,
        clean_session: bool,
        keep_alive: u16,
        will: Option<Message>,
    },
    Publish(Publish),
    PubAck { packet_id: u16 },
    PubRec { packet_id: u16 },
    PubRel { packet_id: u16 },
    PubComp { packet_id: u16 },
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    PingReq,
    PingResp,
    Disconnect,
}

/// 报文编解码器，由外部实现（wire 格式不在本库范围内）
pub trait Codec: Send + 'static {
    /// 从读缓冲区解出当前能解出的所有完整报文
    /// 不完整的尾部字节留在缓冲区，等待下一批数据
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Vec<Packet>, Error>;

    /// 把一个报文编码进写缓冲区
    fn encode(&mut self, packet: &Packet, buf: &mut BytesMut) -> Result<(), Error>;
}
