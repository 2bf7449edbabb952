//! broker 级协作方的契约
//! 注册表与持久化层跨会话共享，实现方自行保证并发安全；
//! teardown 之后到达的调用必须是无害的

use async_trait::async_trait;

use crate::{
    network::packet::{Message, Publish, Subscribe, Unsubscribe},
    protocol::{self, ClientHandle},
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Persistence operation failed: {0}")]
    Store(String),
    #[error("Registry operation failed: {0}")]
    Registry(String),
}

/// broker 的会话注册表与消息扇出入口
/// 每个 broker 实例持有一个注册表，按依赖注入传给会话，不允许全局单例
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// 是否允许向该客户端转发此消息（纯判定，无副作用）
    fn authorize_forward(&self, client_id: &str, message: &Message) -> bool;

    /// 注册表中是否仍持有该会话
    fn contains(&self, client_id: &str) -> bool;

    /// 握手成功后注册会话
    async fn register(&self, client_id: &str, handle: ClientHandle) -> Result<(), Error>;

    /// 注销会话，幂等
    async fn unregister(&self, client_id: &str);

    /// 向 broker 发布一条消息（遗嘱消息走这里），client_id 为消息来源的会话
    async fn publish(&self, client_id: &str, message: Message) -> Result<(), Error>;

    /// broker 级订阅处理
    async fn subscribe(&self, client_id: &str, subscribe: Subscribe) -> Result<(), Error>;

    /// broker 级退订处理
    async fn unsubscribe(&self, client_id: &str, unsubscribe: Unsubscribe) -> Result<(), Error>;

    /// 会话故障通知
    async fn client_error(&self, client_id: &str, error: &protocol::Error);
}

/// 持久化层
/// 只消费 enqueue/update/clear 这个窄契约，存储内部布局不在本库范围内
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// 非 clean 会话的 QoS >= 1 消息，在去重/鉴权之前排队
    async fn outgoing_enqueue(&self, client_id: &str, message: &Message) -> Result<(), Error>;

    /// 在写入网络之前持久化一条在途投递，崩溃后可由重放恢复
    async fn outgoing_update(&self, client_id: &str, publish: &Publish) -> Result<(), Error>;

    /// 投递被放弃时释放已预留的包 id，避免泄漏
    async fn outgoing_clear_message_id(
        &self,
        client_id: &str,
        message: &Message,
    ) -> Result<(), Error>;
}
