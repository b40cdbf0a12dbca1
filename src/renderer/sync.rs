//! 提交与围栏同步
//!
//! 每次 `enqueue` 执行命令列表后立即在队列上 Signal 一个新的围栏值，
//! 并把这个值记到列表所属的分配器上。`wait_for_execution` 阻塞到最后
//! 一次 Signal 的值完成，之后该分配器可以安全重置，被引用的资源也可以释放。

use std::cell::Cell;

use super::command::{CommandList, SubmitType};
use super::device::{Device, GpuBackend, SubmittedList};
use crate::core::error::{Result, SandboxError};

/// 围栏值
///
/// 单调递增，0 表示还没有任何提交。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// GPU 围栏
///
/// 记录 CPU 侧最后一次 Signal 的值，已完成的值从 GPU 查询。
pub struct GpuFence {
    device: Device,
    current: Cell<FenceValue>,
}

impl GpuFence {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            current: Cell::new(FenceValue::default()),
        }
    }

    /// 最后一次 Signal 的值
    pub fn current_value(&self) -> FenceValue {
        self.current.get()
    }

    /// 递增并在队列上 Signal 新值
    ///
    /// 调用方已经持有后端的借用，所以这里直接接收后端。Signal 失败时当前值不变。
    pub fn increment(&self, backend: &mut dyn GpuBackend) -> Result<FenceValue> {
        let next = self.current.get().next();
        backend.signal(next.value())?;
        self.current.set(next);
        Ok(next)
    }

    pub fn completed_value(&self) -> FenceValue {
        FenceValue::new(self.device.backend().completed_value())
    }

    pub fn is_completed(&self, value: FenceValue) -> bool {
        self.completed_value() >= value
    }

    /// 阻塞到 `value` 完成，等待从未 Signal 过的值是错误
    pub fn wait_for_value(&self, value: FenceValue) -> Result<()> {
        if value > self.current.get() {
            return Err(SandboxError::validation(format!(
                "waiting on fence {} which was never signaled (last {})",
                value.value(),
                self.current.get().value()
            )));
        }
        if self.is_completed(value) {
            return Ok(());
        }
        self.device.backend().wait_for_value(value.value())
    }
}

/// 直接命令队列与它的围栏
pub struct CommandQueue {
    device: Device,
    fence: GpuFence,
}

impl CommandQueue {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            fence: GpuFence::new(device),
        }
    }

    /// 提交一个已关闭的直接命令列表
    pub fn enqueue(&self, list: &CommandList) -> Result<FenceValue> {
        self.enqueue_many(&[list])
    }

    /// 一次 ExecuteCommandLists 提交多个列表，随后 Signal
    pub fn enqueue_many(&self, lists: &[&CommandList]) -> Result<FenceValue> {
        for list in lists {
            if list.submit_type() != SubmitType::Direct {
                return Err(SandboxError::validation("bundles cannot be submitted to a queue"));
            }
            if list.is_open() {
                return Err(SandboxError::validation("command list must be closed before submission"));
            }
        }

        let submitted: Vec<SubmittedList<'_>> = lists
            .iter()
            .map(|list| SubmittedList {
                allocator: list.allocator(),
                pipeline: list.pipeline(),
                commands: list.commands(),
            })
            .collect();

        let fence = {
            let mut backend = self.device.backend();
            backend.execute_command_lists(&submitted)?;
            self.fence.increment(&mut **backend)?
        };

        for list in lists {
            list.mark_submitted(fence);
        }

        tracing::trace!(lists = lists.len(), fence = fence.value(), "Command lists submitted");
        Ok(fence)
    }

    /// 等待最后一次提交完成
    pub fn wait_for_execution(&self) -> Result<()> {
        self.fence.wait_for_value(self.fence.current_value())
    }

    /// 等待指定围栏值
    pub fn wait_for(&self, fence: FenceValue) -> Result<()> {
        self.fence.wait_for_value(fence)
    }

    /// 再 Signal 一次并等待，队列之前的所有工作都已完成
    pub fn flush(&self) -> Result<()> {
        let fence = self.fence.increment(&mut **self.device.backend())?;
        self.fence.wait_for_value(fence)
    }

    pub fn fence(&self) -> &GpuFence {
        &self.fence
    }

    pub fn last_signaled(&self) -> FenceValue {
        self.fence.current_value()
    }

    pub fn completed_value(&self) -> FenceValue {
        self.fence.completed_value()
    }

    pub fn is_complete(&self, fence: FenceValue) -> bool {
        self.fence.is_completed(fence)
    }
}
