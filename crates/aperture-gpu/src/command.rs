//! Command recording and per-recorder synchronization state.
//!
//! Each [`CommandRecorder`] owns one primary command buffer plus the
//! semaphores that tie it into a submission chain: a lazily-created signal
//! semaphore that downstream work may wait on, and a FIFO list of injected
//! wait semaphores drained exactly once at submit time.

use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// How a recorded command buffer may be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferUsage {
    /// Submitted once, then reset or discarded.
    OneTime,
    /// May be submitted repeatedly without re-recording.
    Persistent,
}

impl CommandBufferUsage {
    const fn to_vk(self) -> vk::CommandBufferUsageFlags {
        match self {
            Self::OneTime => vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            Self::Persistent => vk::CommandBufferUsageFlags::empty(),
        }
    }
}

/// Lazily-created signal semaphore with the stage it signals at.
///
/// The semaphore exists only once some downstream consumer has asked for it;
/// a recorder nothing waits on never allocates one.
pub(crate) struct SignalSlot {
    semaphore: Option<vk::Semaphore>,
    stage: vk::PipelineStageFlags,
}

impl SignalSlot {
    pub(crate) fn new() -> Self {
        Self {
            semaphore: None,
            stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    /// Set the stage downstream waiters should block at.
    pub(crate) fn set_stage(&mut self, stage: vk::PipelineStageFlags) {
        self.stage = stage;
    }

    /// Return the semaphore, creating it on first request. Repeated calls
    /// return the same handle.
    pub(crate) fn get_or_create<F>(
        &mut self,
        create: F,
    ) -> Result<(vk::Semaphore, vk::PipelineStageFlags)>
    where
        F: FnOnce() -> Result<vk::Semaphore>,
    {
        if self.semaphore.is_none() {
            self.semaphore = Some(create()?);
        }
        Ok((self.semaphore.unwrap_or_default(), self.stage))
    }

    /// Whether a semaphore was ever requested.
    pub(crate) fn is_armed(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Take the semaphore for destruction.
    pub(crate) fn take(&mut self) -> Option<vk::Semaphore> {
        self.semaphore.take()
    }
}

/// FIFO list of semaphores a command buffer must wait on before executing.
#[derive(Default)]
pub(crate) struct WaitList {
    entries: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
}

impl WaitList {
    pub(crate) fn push(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.entries.push((semaphore, stage));
    }

    /// Drain all pending waits in injection order. The list is empty
    /// afterwards; each wait is consumed by exactly one submission.
    pub(crate) fn drain(&mut self) -> Vec<(vk::Semaphore, vk::PipelineStageFlags)> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Records GPU commands into a primary command buffer.
pub struct CommandRecorder {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    usage: CommandBufferUsage,
    pub(crate) signal: SignalSlot,
    pub(crate) waits: WaitList,
    recording: bool,
}

impl CommandRecorder {
    pub(crate) fn new(
        device: Arc<ash::Device>,
        pool: vk::CommandPool,
        usage: CommandBufferUsage,
    ) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(|code| {
            GpuError::ResourceCreation {
                what: "command buffer",
                code,
            }
        })?;

        Ok(Self {
            device,
            pool,
            command_buffer: buffers[0],
            usage,
            signal: SignalSlot::new(),
            waits: WaitList::default(),
            recording: false,
        })
    }

    /// Get the raw command buffer handle.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub(crate) fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Begin an encoding session on this recorder.
    pub fn begin_encoder(&mut self) -> Result<crate::encoder::CommandEncoder<'_>> {
        crate::encoder::CommandEncoder::new(self)
    }

    /// Begin recording.
    pub fn begin(&mut self) -> Result<()> {
        if self.recording {
            return Err(GpuError::InvalidState(
                "Command buffer is already recording".to_string(),
            ));
        }

        let begin_info = vk::CommandBufferBeginInfo::default().flags(self.usage.to_vk());
        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        self.recording = true;
        Ok(())
    }

    /// End recording. The buffer is then ready for submission.
    pub fn finish(&mut self) -> Result<()> {
        if !self.recording {
            return Err(GpuError::InvalidState(
                "Command buffer is not recording".to_string(),
            ));
        }

        unsafe {
            self.device.end_command_buffer(self.command_buffer)?;
        }
        self.recording = false;
        Ok(())
    }

    /// Set the pipeline stage the signal semaphore fires at.
    pub fn set_signal_stage(&mut self, stage: vk::PipelineStageFlags) {
        self.signal.set_stage(stage);
    }

    /// The semaphore this buffer signals on completion, created on first
    /// request.
    pub fn signal_semaphore(&mut self) -> Result<(vk::Semaphore, vk::PipelineStageFlags)> {
        let device = &self.device;
        self.signal.get_or_create(|| {
            let info = vk::SemaphoreCreateInfo::default();
            unsafe { device.create_semaphore(&info, None) }.map_err(|code| {
                GpuError::ResourceCreation {
                    what: "semaphore",
                    code,
                }
            })
        })
    }

    /// Add a semaphore this buffer must wait on before executing.
    pub fn inject_wait_semaphore(
        &mut self,
        semaphore: vk::Semaphore,
        stage: vk::PipelineStageFlags,
    ) {
        self.waits.push(semaphore, stage);
    }

    /// Drain all injected waits. Called once at submit time.
    pub fn eject_wait_semaphores(&mut self) -> Vec<(vk::Semaphore, vk::PipelineStageFlags)> {
        self.waits.drain()
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        unsafe {
            if let Some(semaphore) = self.signal.take() {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.device
                .free_command_buffers(self.pool, &[self.command_buffer]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn signal_slot_creates_once_and_reuses() {
        let mut slot = SignalSlot::new();
        assert!(!slot.is_armed());

        let mut created = 0;
        let (first, stage) = slot
            .get_or_create(|| {
                created += 1;
                Ok(vk::Semaphore::from_raw(0xA))
            })
            .unwrap();
        assert_eq!(first, vk::Semaphore::from_raw(0xA));
        assert_eq!(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert!(slot.is_armed());

        let (second, _) = slot
            .get_or_create(|| {
                created += 1;
                Ok(vk::Semaphore::from_raw(0xB))
            })
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(created, 1);
    }

    #[test]
    fn signal_slot_reports_configured_stage() {
        let mut slot = SignalSlot::new();
        slot.set_stage(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);

        let (_, stage) = slot
            .get_or_create(|| Ok(vk::Semaphore::from_raw(1)))
            .unwrap();
        assert_eq!(stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn signal_slot_failed_creation_stays_unarmed() {
        let mut slot = SignalSlot::new();
        let result = slot.get_or_create(|| {
            Err(GpuError::ResourceCreation {
                what: "semaphore",
                code: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            })
        });
        assert!(result.is_err());
        assert!(!slot.is_armed());
    }

    #[test]
    fn wait_list_drains_in_fifo_order_exactly_once() {
        let mut waits = WaitList::default();
        waits.push(
            vk::Semaphore::from_raw(1),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        );
        waits.push(vk::Semaphore::from_raw(2), vk::PipelineStageFlags::TRANSFER);

        let drained = waits.drain();
        assert_eq!(
            drained,
            vec![
                (
                    vk::Semaphore::from_raw(1),
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                ),
                (vk::Semaphore::from_raw(2), vk::PipelineStageFlags::TRANSFER),
            ]
        );
        assert!(waits.is_empty());
        assert!(waits.drain().is_empty());
    }
}
