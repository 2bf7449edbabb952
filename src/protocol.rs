//! 协议层
//! 会话核心与外部（broker、报文处理器）之间的交互面

use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{
    broker,
    network::packet::{self, Message, Packet, QoS, Subscribe, SubscribeFilter, Unsubscribe},
};

pub use client::{Client, Subscription};

mod client;
mod delivery;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Broker error: {0}")]
    Broker(#[from] broker::Error),
    #[error("Connect did not arrive in time")]
    ConnectTimeout,
    #[error("Keep alive timeout")]
    KeepAlive,
    #[error("Session closed")]
    Closed,
}

/// 投递/操作完成回执
pub type Done = oneshot::Sender<Result<(), Error>>;

/// 握手结果，由外部 connect 处理器回填给会话
#[derive(Debug)]
pub struct ConnectAccept {
    pub client_id: String,
    pub clean_session: bool,
    /// 客户端协商的 keepalive，None 表示不启用
    pub keep_alive: Option<Duration>,
    pub will: Option<Message>,
}

/// 订阅请求
/// 调用方可以传单个 filter、filter 列表或完整报文，入口处一次性归一化
#[derive(Debug, Clone)]
pub enum SubscribeRequest {
    Single(SubscribeFilter),
    List(Vec<SubscribeFilter>),
    Packet(Subscribe),
}

impl SubscribeRequest {
    pub fn normalize(self) -> Subscribe {
        match self {
            Self::Single(filter) => Subscribe {
                subscriptions: vec![filter],
            },
            Self::List(filters) => Subscribe {
                subscriptions: filters,
            },
            Self::Packet(subscribe) => subscribe,
        }
    }
}

/// 退订请求，形状处理与 [`SubscribeRequest`] 相同
#[derive(Debug, Clone)]
pub enum UnsubscribeRequest {
    Single(String),
    List(Vec<String>),
    Packet(Unsubscribe),
}

impl UnsubscribeRequest {
    pub fn normalize(self) -> Unsubscribe {
        match self {
            Self::Single(filter) => Unsubscribe {
                unsubscriptions: vec![filter],
            },
            Self::List(filters) => Unsubscribe {
                unsubscriptions: filters,
            },
            Self::Packet(unsubscribe) => unsubscribe,
        }
    }
}

/// 发送给会话事件循环的命令
#[derive(Debug)]
pub(crate) enum Command {
    /// 握手成功
    Accept(ConnectAccept),
    /// broker 扇出的消息，qos 为订阅端的投递上限
    Deliver {
        message: Message,
        qos: QoS,
        done: Done,
    },
    /// 程序化发布（遗嘱重放等）
    Publish { message: Message, done: Done },
    Subscribe {
        request: SubscribeRequest,
        done: Done,
    },
    Unsubscribe {
        request: UnsubscribeRequest,
        done: Done,
    },
    /// 客户端已发送协议级断开
    Disconnected,
    /// QoS 确认流程结束，释放包 id
    DeliveryComplete { packet_id: u16 },
    Close {
        done: Option<oneshot::Sender<()>>,
    },
}

/// 会话句柄
/// broker 与各报文处理器通过它与会话交互，可自由克隆
#[derive(Debug, Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<Command>) -> Self {
        Self { cmd_tx }
    }

    /// 握手成功，标记会话为 connected
    pub async fn accept(&self, accept: ConnectAccept) -> Result<(), Error> {
        self.send(Command::Accept(accept)).await
    }

    /// 投递一条消息，完成即写入被传输层接受（或被判定丢弃）
    pub async fn deliver(&self, message: Message, qos: QoS) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Deliver { message, qos, done }).await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// 按消息自身的 QoS 发布
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Publish { message, done }).await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Subscribe { request, done }).await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn unsubscribe(&self, request: UnsubscribeRequest) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { request, done }).await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// 客户端已优雅断开，遗嘱不再发布
    pub async fn mark_disconnected(&self) -> Result<(), Error> {
        self.send(Command::Disconnected).await
    }

    /// QoS 确认流程（puback/pubcomp）结束后由处理器调用
    pub async fn delivery_complete(&self, packet_id: u16) -> Result<(), Error> {
        self.send(Command::DeliveryComplete { packet_id }).await
    }

    /// 请求关闭会话，teardown 完成后返回
    /// 会话已不存在时视为已关闭
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Close { done: Some(tx) })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: Command) -> Result<(), Error> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Closed)
    }
}

/// 每种报文的协议处理逻辑，由外部实现
/// 处理完成（返回）即通知会话结算一个解码批次
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn handle(&self, client: &ClientHandle, packet: Packet) -> Result<(), Error>;
}
