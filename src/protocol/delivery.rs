//! 投递管线的纯状态部件：解码批次计数、去重表、包 id 分配

use std::collections::{HashMap, HashSet};

use crate::network::packet::Message;

/// 在途解码批次计数
/// 构造时有一个隐含的待解码批次；计数归零前不允许发起新的读取，
/// 保证解码速度被处理器完成速度自然限流
#[derive(Debug)]
pub(crate) struct Batches(u32);

impl Batches {
    pub(crate) fn new() -> Self {
        Self(1)
    }

    /// 结算一个批次，返回当前是否允许发起新的读取
    pub(crate) fn settle(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }

    /// 一个报文交给了处理器
    pub(crate) fn dispatched(&mut self) {
        self.0 += 1;
    }

    pub(crate) fn idle(&self) -> bool {
        self.0 == 0
    }
}

/// 去重表：按消息来源记录已转发的最高序号
/// 单调性过滤，不是滑动窗口：乱序到达的旧消息一律拒绝
#[derive(Debug, Default)]
pub(crate) struct Duplicates {
    seen: HashMap<String, u64>,
}

impl Duplicates {
    /// 没有来源的消息（非集群消息）总是转发；
    /// 有来源的只有序号严格大于水位时才转发，且只在转发时推进水位
    pub(crate) fn should_forward(&mut self, message: &Message) -> bool {
        let origin = match &message.origin {
            Some(origin) => origin,
            None => return true,
        };
        let last = self.seen.get(&origin.broker_id).copied().unwrap_or(0);
        if origin.counter > last {
            self.seen.insert(origin.broker_id.clone(), origin.counter);
            true
        } else {
            false
        }
    }
}

/// 包 id 分配器
/// 伪随机起点，回绕自增，跳过 0 和仍在途的 id
#[derive(Debug)]
pub(crate) struct PacketIds {
    next: u16,
    inflight: HashSet<u16>,
}

impl PacketIds {
    pub(crate) fn new() -> Self {
        Self {
            next: rand::random(),
            inflight: HashSet::new(),
        }
    }

    #[cfg(test)]
    fn starting_at(next: u16) -> Self {
        Self {
            next,
            inflight: HashSet::new(),
        }
    }

    /// 分配一个与在途投递不冲突的 id
    pub(crate) fn alloc(&mut self) -> u16 {
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                continue;
            }
            if self.inflight.insert(self.next) {
                return self.next;
            }
        }
    }

    /// 确认流程结束，释放 id
    pub(crate) fn release(&mut self, packet_id: u16) {
        self.inflight.remove(&packet_id);
    }
}
