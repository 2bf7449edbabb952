#![allow(dead_code)]

//! mqtt broker 的单连接会话核心库
//! 管理一条客户端连接从握手到 teardown 的完整生命周期：
//! 带背压的入站解码、QoS 投递管线、集群消息去重、非 clean 会话的持久化配合
//!
//! 报文编解码、订阅匹配与扇出、持久化存储均为外部协作方，通过 trait 注入

pub mod broker;
pub mod config;
pub mod network;
pub mod protocol;

pub use broker::{Persistence, Registry};
pub use network::{packet, Transport};
pub use protocol::{
    Client, ClientHandle, ConnectAccept, PacketHandler, SubscribeRequest, UnsubscribeRequest,
};
