use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::Arc,
    time::Duration,
};

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{self, Instant},
};

use crate::{
    broker::{Persistence, Registry},
    config,
    network::{
        packet::{Codec, Message, Packet, Publish, QoS},
        Transport,
    },
};

use super::{
    delivery::{Batches, Duplicates, PacketIds},
    ClientHandle, Command, ConnectAccept, Done, Error, PacketHandler, SubscribeRequest,
    UnsubscribeRequest,
};

/// 会话状态机，closed 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PendingConnect,
    Connected,
    Closing,
    Closed,
}

/// 订阅元数据
#[derive(Debug, Clone)]
pub struct Subscription {
    pub qos: QoS,
}

/// 一条客户端连接的会话核心
/// 持有连接从握手到 teardown 的全部状态，所有状态只在本会话的
/// 事件循环协程内变更；跨会话的协作方（注册表、持久化）自行保证并发安全
pub struct Client<T: Transport> {
    /// 客户端 id，握手成功后由 connect 处理器回填，之后不再变化
    id: Option<String>,
    state: State,
    /// 客户端已发送协议级断开，teardown 时不再发布遗嘱
    disconnected: bool,
    errored: bool,
    /// clean 会话不跨连接持久化状态
    clean: bool,

    transport: T,
    codec: Box<dyn Codec>,
    registry: Arc<dyn Registry>,
    persistence: Arc<dyn Persistence>,
    handler: Arc<dyn PacketHandler>,

    /// 读缓冲区
    read_buf: BytesMut,
    /// 待写报文及其完成回执
    /// teardown 时未写出的回执也要兑现，不能让调用方悬着
    write_queue: VecDeque<(Packet, Option<Done>)>,

    batches: Batches,
    duplicates: Duplicates,
    packet_ids: PacketIds,

    /// 当前持有的订阅，key = topic-filter
    subscriptions: HashMap<String, Subscription>,
    /// 遗嘱消息，发布或清除前由会话独占
    will: Option<Message>,

    connect_deadline: Option<Instant>,
    keepalive: Option<Duration>,
    keepalive_deadline: Option<Instant>,

    handle: ClientHandle,
    cmd_rx: mpsc::Receiver<Command>,
    handled_tx: mpsc::UnboundedSender<Result<(), Error>>,
    handled_rx: mpsc::UnboundedReceiver<Result<(), Error>>,

    /// 触发 teardown 的首个致命错误
    fatal: Option<Error>,
}

impl<T: Transport> Client<T> {
    pub fn new(
        transport: T,
        codec: Box<dyn Codec>,
        registry: Arc<dyn Registry>,
        persistence: Arc<dyn Persistence>,
        handler: Arc<dyn PacketHandler>,
        cfg: &config::Connection,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(cfg.channel_capacity);
        let (handled_tx, handled_rx) = mpsc::unbounded_channel();
        Self {
            id: None,
            state: State::PendingConnect,
            disconnected: false,
            errored: false,
            clean: true,
            transport,
            codec,
            registry,
            persistence,
            handler,
            read_buf: BytesMut::new(),
            write_queue: VecDeque::new(),
            batches: Batches::new(),
            duplicates: Duplicates::default(),
            packet_ids: PacketIds::new(),
            subscriptions: HashMap::new(),
            will: None,
            connect_deadline: Some(
                Instant::now() + Duration::from_millis(cfg.connect_timeout_ms),
            ),
            keepalive: None,
            keepalive_deadline: None,
            handle: ClientHandle::new(cmd_tx),
            cmd_rx,
            handled_tx,
            handled_rx,
            fatal: None,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    fn client_id(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// 开启会话事件循环
    /// * 从传输层读字节、解码、分发给报文处理器（受批次计数背压约束）
    /// * 接收 broker 侧命令（投递、订阅、关闭）
    /// * 看护 connect 与 keepalive 两个定时器
    /// 循环在 teardown 完成后退出；致命错误在 teardown 之后返回给调用方
    pub async fn start(mut self) -> Result<(), Error> {
        // 构造时有一个隐含的待解码批次
        if let Err(e) = self.on_readable().await {
            self.on_error(e).await;
        }
        loop {
            if self.state == State::Closed {
                break;
            }
            let can_read = self.batches.idle()
                && matches!(self.state, State::PendingConnect | State::Connected);
            let connect_at = self.connect_deadline;
            let keepalive_at = self.keepalive_deadline;
            select! {
                res = self.transport.readable(), if can_read => match res {
                    Ok(()) => {
                        if let Err(e) = self.on_readable().await {
                            self.on_error(e).await;
                        }
                    }
                    Err(e) => self.on_error(Error::Io(e)).await,
                },
                Some(res) = self.handled_rx.recv() => self.on_packet_handled(res).await,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.close(None).await,
                },
                _ = time::sleep_until(connect_at.unwrap_or_else(far_deadline)), if connect_at.is_some() => {
                    self.on_error(Error::ConnectTimeout).await;
                }
                _ = time::sleep_until(keepalive_at.unwrap_or_else(far_deadline)), if keepalive_at.is_some() => {
                    self.on_error(Error::KeepAlive).await;
                }
            }
            if self.state != State::Closed {
                if let Err(e) = self.flush_writes().await {
                    self.on_error(e).await;
                }
            }
        }
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 结算一个解码批次；仅当计数归零时才真正从传输层拉取数据
    /// 计数未归零说明上一批解出的报文还没处理完，读取被推迟
    async fn on_readable(&mut self) -> Result<(), Error> {
        if matches!(self.state, State::Closing | State::Closed) {
            return Ok(());
        }
        if !self.batches.settle() {
            return Ok(());
        }
        match self.transport.read_available(&mut self.read_buf) {
            // 对端正常关闭
            Ok(0) => {
                self.close(None).await;
                Ok(())
            }
            Ok(_) => {
                if let Some(keepalive) = self.keepalive {
                    self.keepalive_deadline = Some(Instant::now() + keepalive);
                }
                let packets = self.codec.decode(&mut self.read_buf)?;
                for packet in packets {
                    self.dispatch(packet);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// 把解码出的报文交给外部处理器，处理完成后回到批次结算
    fn dispatch(&mut self, packet: Packet) {
        self.batches.dispatched();
        let handler = self.handler.clone();
        let handle = self.handle.clone();
        let handled_tx = self.handled_tx.clone();
        tokio::spawn(async move {
            let res = handler.handle(&handle, packet).await;
            let _ = handled_tx.send(res);
        });
    }

    async fn on_packet_handled(&mut self, res: Result<(), Error>) {
        match res {
            Ok(()) => {
                if let Err(e) = self.on_readable().await {
                    self.on_error(e).await;
                }
            }
            Err(e) => self.on_error(e).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Accept(accept) => self.handle_accept(accept),
            Command::Deliver { message, qos, done } => {
                self.deliver(Arc::new(message), qos, done).await
            }
            Command::Publish { message, done } => {
                self.handle_publish(Arc::new(message), done).await
            }
            Command::Subscribe { request, done } => self.handle_subscribe(request, done).await,
            Command::Unsubscribe { request, done } => {
                self.handle_unsubscribe(request, done).await
            }
            Command::Disconnected => self.disconnected = true,
            Command::DeliveryComplete { packet_id } => self.packet_ids.release(packet_id),
            Command::Close { done } => self.close(done).await,
        }
    }

    fn handle_accept(&mut self, accept: ConnectAccept) {
        if self.state != State::PendingConnect {
            return;
        }
        info!(
            "client {} connected, clean_session: {}",
            accept.client_id, accept.clean_session
        );
        self.id = Some(accept.client_id);
        self.clean = accept.clean_session;
        self.will = accept.will;
        self.state = State::Connected;
        self.connect_deadline = None;
        // keepalive 的 1.5 倍宽限
        self.keepalive = accept.keep_alive.map(|k| k + k.mul_f32(0.5));
        self.keepalive_deadline = self.keepalive.map(|k| Instant::now() + k);
    }

    /// 投递管线入口。qos 为订阅端的投递上限，
    /// 消息本身以 QoS0 发布时同样降级走 QoS0 路径
    async fn deliver(&mut self, message: Arc<Message>, qos: QoS, done: Done) {
        if qos == QoS::AtMostOnce || message.qos == QoS::AtMostOnce {
            self.deliver0(message, done);
        } else {
            self.deliver_qos(message, qos, done).await;
        }
    }

    /// QoS0 投递：不持久化任何状态，写入被传输层接受即完成
    /// 重复或未授权的消息直接兑现回执，无副作用
    fn deliver0(&mut self, message: Arc<Message>, done: Done) {
        let forward = self.duplicates.should_forward(&message)
            && self.registry.authorize_forward(self.client_id(), &message);
        if forward {
            let publish = Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                packet_id: None,
                message,
            };
            self.write_queue.push_back((Packet::Publish(publish), Some(done)));
        } else {
            let _ = done.send(Ok(()));
        }
    }

    /// QoS >= 1 投递
    /// 非 clean 会话先把在途投递落盘再写网络，崩溃后可由重放恢复；
    /// 投递被放弃时释放已预留的包 id
    async fn deliver_qos(&mut self, message: Arc<Message>, qos: QoS, done: Done) {
        // 订阅端的 qos 只是上限，投递等级不得超过发布时的 QoS
        let qos = message.qos.min(qos);
        let not_duplicate = self.duplicates.should_forward(&message);
        let authorized =
            not_duplicate && self.registry.authorize_forward(self.client_id(), &message);
        if authorized {
            let packet_id = self.packet_ids.alloc();
            let publish = Publish {
                dup: false,
                qos,
                packet_id: Some(packet_id),
                message,
            };
            if self.clean {
                self.write_queue.push_back((Packet::Publish(publish), Some(done)));
            } else {
                match self
                    .persistence
                    .outgoing_update(self.client_id(), &publish)
                    .await
                {
                    Ok(()) => {
                        self.write_queue.push_back((Packet::Publish(publish), Some(done)));
                    }
                    // 持久化不一致后在途记账不可信，升级为会话错误
                    Err(e) => {
                        self.packet_ids.release(packet_id);
                        let _ = done.send(Err(Error::Broker(e.clone())));
                        self.on_error(Error::Broker(e)).await;
                    }
                }
            }
        } else {
            // 丢弃原因要区分：重复 与 未授权 不是一回事
            if not_duplicate {
                debug!(
                    "client {}: drop delivery to {}, not authorized",
                    self.client_id(),
                    message.topic
                );
            } else {
                debug!(
                    "client {}: drop delivery to {}, duplicate from origin",
                    self.client_id(),
                    message.topic
                );
            }
            if !self.clean {
                if let Err(e) = self
                    .persistence
                    .outgoing_clear_message_id(self.client_id(), &message)
                    .await
                {
                    warn!("client {}: clear outgoing id failed: {}", self.client_id(), e);
                }
            }
            let _ = done.send(Ok(()));
        }
    }

    /// 程序化发布入口（遗嘱重放等），按消息自身的 QoS 投递
    /// 非 clean 会话的 QoS >= 1 消息先进持久化队列，再走投递管线
    async fn handle_publish(&mut self, message: Arc<Message>, done: Done) {
        let qos = message.qos;
        if qos == QoS::AtMostOnce {
            self.deliver0(message, done);
        } else if !self.clean && self.id.is_some() {
            match self
                .persistence
                .outgoing_enqueue(self.client_id(), &message)
                .await
            {
                Ok(()) => self.deliver_qos(message, qos, done).await,
                Err(e) => {
                    let _ = done.send(Err(Error::Broker(e)));
                }
            }
        } else {
            self.deliver_qos(message, qos, done).await;
        }
    }

    /// 订阅门面：入口处一次性归一化，协议逻辑全部在 broker 侧
    /// 成功后记录到会话的订阅表，teardown 时据此退订
    async fn handle_subscribe(&mut self, request: SubscribeRequest, done: Done) {
        let subscribe = request.normalize();
        match self
            .registry
            .subscribe(self.client_id(), subscribe.clone())
            .await
        {
            Ok(()) => {
                for filter in subscribe.subscriptions {
                    self.subscriptions
                        .insert(filter.filter, Subscription { qos: filter.qos });
                }
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                let _ = done.send(Err(Error::Broker(e)));
            }
        }
    }

    async fn handle_unsubscribe(&mut self, request: UnsubscribeRequest, done: Done) {
        let unsubscribe = request.normalize();
        match self
            .registry
            .unsubscribe(self.client_id(), unsubscribe.clone())
            .await
        {
            Ok(()) => {
                for filter in &unsubscribe.unsubscriptions {
                    self.subscriptions.remove(filter);
                }
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                let _ = done.send(Err(Error::Broker(e)));
            }
        }
    }

    /// 把写队列刷入传输层；write 返回即视为接受，兑现回执
    /// 中途失败的报文留在队首，由 teardown 兑现其回执
    async fn flush_writes(&mut self) -> Result<(), Error> {
        while let Some((packet, done)) = self.write_queue.pop_front() {
            let mut buf = BytesMut::new();
            if let Err(e) = self.codec.encode(&packet, &mut buf) {
                self.write_queue.push_front((packet, done));
                return Err(e.into());
            }
            if let Err(e) = self.transport.write(&buf).await {
                self.write_queue.push_front((packet, done));
                return Err(Error::Io(e));
            }
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
        }
        Ok(())
    }

    /// 所有会话级故障汇聚到这里：标记、通知 broker、触发一次幂等 teardown
    async fn on_error(&mut self, error: Error) {
        if matches!(self.state, State::Closing | State::Closed) {
            // teardown 之后的错误不再向外传播
            debug!("client {}: error after close: {}", self.client_id(), error);
            return;
        }
        self.errored = true;
        self.registry.client_error(self.client_id(), &error).await;
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        self.close(None).await;
    }

    /// teardown 协调器
    /// 幂等：无论由错误、对端关闭还是主动请求触发，副作用只发生一次。
    /// 退订与遗嘱发布失败不阻塞 teardown
    async fn close(&mut self, done: Option<oneshot::Sender<()>>) {
        if matches!(self.state, State::Closing | State::Closed) {
            if let Some(done) = done {
                let _ = done.send(());
            }
            return;
        }
        let was_connected = self.state == State::Connected;
        // 进入 closing 即停止解码、分发与错误外传
        self.state = State::Closing;

        // 先退订所有持有的订阅
        if was_connected && !self.subscriptions.is_empty() {
            let filters: Vec<String> = self.subscriptions.keys().cloned().collect();
            let unsubscribe = UnsubscribeRequest::List(filters).normalize();
            if let Err(e) = self.registry.unsubscribe(self.client_id(), unsubscribe).await {
                warn!(
                    "client {}: unsubscribe on close failed: {}",
                    self.client_id(),
                    e
                );
            }
            self.subscriptions.clear();
        }

        // 清掉两个定时器
        self.connect_deadline = None;
        self.keepalive = None;
        self.keepalive_deadline = None;

        // 遗嘱只发布一次：take 之后再次进入为空
        if !self.disconnected {
            if let Some(will) = self.will.take() {
                debug!(
                    "client {}: publishing will to {}",
                    self.client_id(),
                    will.topic
                );
                if let Err(e) = self.registry.publish(self.client_id(), will).await {
                    warn!("client {}: will publish failed: {}", self.client_id(), e);
                }
            }
        }

        // 注册表若仍持有此会话则注销
        if let Some(id) = self.id.clone() {
            if self.registry.contains(&id) {
                self.registry.unregister(&id).await;
            }
        }

        // 兑现写队列中尚未写出的回执，不再写网络
        while let Some((_, done)) = self.write_queue.pop_front() {
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
        }

        if let Err(e) = self.transport.shutdown().await {
            debug!("client {}: transport shutdown: {}", self.client_id(), e);
        }

        if let Some(done) = done {
            let _ = done.send(());
        }
        self.state = State::Closed;
        info!("client {}: session closed", self.client_id());
    }
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
