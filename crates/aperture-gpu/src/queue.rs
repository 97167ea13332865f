//! Queue submission with implicit ordering between command buffers.
//!
//! A batch of recorders submitted together executes in slice order: each
//! submission's signal semaphore becomes the next submission's wait. The
//! signal for the final submission is only the swapchain's render-done
//! semaphore, and only when the batch presents; nothing downstream means no
//! semaphore at all.

use crate::command::CommandRecorder;
use crate::error::{GpuError, Result};
use crate::swapchain::Swapchain;
use ash::vk;
use std::sync::Arc;
use tracing::trace;

/// Anything that can take part in a submission chain.
pub(crate) trait Chainable {
    fn command_buffer(&self) -> vk::CommandBuffer;
    /// Signal semaphore for downstream waiters, created on first request.
    fn signal_semaphore(&mut self) -> Result<(vk::Semaphore, vk::PipelineStageFlags)>;
    /// Drain injected waits; each wait is consumed exactly once.
    fn eject_wait_semaphores(&mut self) -> Vec<(vk::Semaphore, vk::PipelineStageFlags)>;
}

impl Chainable for CommandRecorder {
    fn command_buffer(&self) -> vk::CommandBuffer {
        CommandRecorder::command_buffer(self)
    }

    fn signal_semaphore(&mut self) -> Result<(vk::Semaphore, vk::PipelineStageFlags)> {
        CommandRecorder::signal_semaphore(self)
    }

    fn eject_wait_semaphores(&mut self) -> Vec<(vk::Semaphore, vk::PipelineStageFlags)> {
        CommandRecorder::eject_wait_semaphores(self)
    }
}

/// Semaphores that couple the final submission of a batch to a swapchain.
pub(crate) struct PresentHooks {
    pub(crate) acquire_semaphore: vk::Semaphore,
    pub(crate) acquire_stage: vk::PipelineStageFlags,
    pub(crate) render_done: vk::Semaphore,
}

/// Owned storage backing one `vk::SubmitInfo`.
pub(crate) struct SubmitDesc {
    pub(crate) command_buffers: Vec<vk::CommandBuffer>,
    pub(crate) wait_semaphores: Vec<vk::Semaphore>,
    pub(crate) wait_stages: Vec<vk::PipelineStageFlags>,
    pub(crate) signal_semaphores: Vec<vk::Semaphore>,
}

/// Thread the submission chain for a batch.
///
/// Submission `i` waits on submission `i-1`'s signal plus its own injected
/// waits, in that order. Only submissions with a downstream consumer get a
/// signal semaphore. A semaphore appearing as both wait and signal of the
/// same submission would deadlock, so it is rejected up front.
pub(crate) fn build_submit_chain<C: Chainable>(
    recorders: &mut [C],
    present: Option<&PresentHooks>,
) -> Result<Vec<SubmitDesc>> {
    let count = recorders.len();
    let mut descs = Vec::with_capacity(count);
    let mut prev_signal: Option<(vk::Semaphore, vk::PipelineStageFlags)> = None;

    for (index, recorder) in recorders.iter_mut().enumerate() {
        let mut wait_semaphores = Vec::new();
        let mut wait_stages = Vec::new();
        let mut signal_semaphores = Vec::new();

        if let Some((semaphore, stage)) = prev_signal.take() {
            wait_semaphores.push(semaphore);
            wait_stages.push(stage);
        }
        for (semaphore, stage) in recorder.eject_wait_semaphores() {
            wait_semaphores.push(semaphore);
            wait_stages.push(stage);
        }

        if index + 1 < count {
            let (semaphore, stage) = recorder.signal_semaphore()?;
            signal_semaphores.push(semaphore);
            prev_signal = Some((semaphore, stage));
        } else if let Some(hooks) = present {
            wait_semaphores.push(hooks.acquire_semaphore);
            wait_stages.push(hooks.acquire_stage);
            signal_semaphores.push(hooks.render_done);
        }

        if signal_semaphores
            .iter()
            .any(|semaphore| wait_semaphores.contains(semaphore))
        {
            return Err(GpuError::InvalidState(format!(
                "Submission {index} waits on its own signal semaphore"
            )));
        }

        descs.push(SubmitDesc {
            command_buffers: vec![recorder.command_buffer()],
            wait_semaphores,
            wait_stages,
            signal_semaphores,
        });
    }

    Ok(descs)
}

/// Submits command recorder batches to a device queue.
///
/// One submission per recorder, all batched into a single `vkQueueSubmit`
/// guarded by one reusable fence. `submit` blocks until the batch completes.
pub struct SubmissionQueue {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    fence: vk::Fence,
}

impl SubmissionQueue {
    pub(crate) fn new(device: Arc<ash::Device>, queue: vk::Queue) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe { device.create_fence(&fence_info, None) }.map_err(|code| {
            GpuError::ResourceCreation {
                what: "fence",
                code,
            }
        })?;

        Ok(Self {
            device,
            queue,
            fence,
        })
    }

    /// Submit `recorders` in order and wait for completion.
    ///
    /// With a swapchain attached, the final submission additionally waits on
    /// the acquired image and signals render-done, and the image is
    /// presented after the fence clears. An out-of-date swapchain surfaces
    /// as a recoverable error.
    pub fn submit(
        &mut self,
        recorders: &mut [CommandRecorder],
        swapchain: Option<&mut Swapchain>,
    ) -> Result<()> {
        if recorders.is_empty() {
            return Ok(());
        }

        let hooks = swapchain.as_ref().map(|sc| sc.present_hooks()).transpose()?;
        let descs = build_submit_chain(recorders, hooks.as_ref())?;

        let submit_infos: Vec<vk::SubmitInfo> = descs
            .iter()
            .map(|desc| {
                vk::SubmitInfo::default()
                    .command_buffers(&desc.command_buffers)
                    .wait_semaphores(&desc.wait_semaphores)
                    .wait_dst_stage_mask(&desc.wait_stages)
                    .signal_semaphores(&desc.signal_semaphores)
            })
            .collect();

        trace!(submissions = submit_infos.len(), "submitting batch");

        unsafe {
            self.device
                .queue_submit(self.queue, &submit_infos, self.fence)
                .map_err(|code| GpuError::Submission {
                    call: "vkQueueSubmit",
                    code,
                })?;

            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|code| GpuError::Submission {
                    call: "vkWaitForFences",
                    code,
                })?;
            self.device
                .reset_fences(&[self.fence])
                .map_err(|code| GpuError::Submission {
                    call: "vkResetFences",
                    code,
                })?;
        }

        if let Some(sc) = swapchain {
            sc.present(self.queue)?;
        }

        Ok(())
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.queue_wait_idle(self.queue);
            self.device.destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    struct StubRecorder {
        cmd: vk::CommandBuffer,
        signal: Option<vk::Semaphore>,
        signal_raw: u64,
        signal_stage: vk::PipelineStageFlags,
        signal_requests: u32,
        waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    }

    impl StubRecorder {
        fn new(cmd_raw: u64, signal_raw: u64) -> Self {
            Self {
                cmd: vk::CommandBuffer::from_raw(cmd_raw),
                signal: None,
                signal_raw,
                signal_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_requests: 0,
                waits: Vec::new(),
            }
        }
    }

    impl Chainable for StubRecorder {
        fn command_buffer(&self) -> vk::CommandBuffer {
            self.cmd
        }

        fn signal_semaphore(&mut self) -> Result<(vk::Semaphore, vk::PipelineStageFlags)> {
            self.signal_requests += 1;
            let semaphore = *self
                .signal
                .get_or_insert(vk::Semaphore::from_raw(self.signal_raw));
            Ok((semaphore, self.signal_stage))
        }

        fn eject_wait_semaphores(&mut self) -> Vec<(vk::Semaphore, vk::PipelineStageFlags)> {
            std::mem::take(&mut self.waits)
        }
    }

    #[test]
    fn chain_threads_signal_into_next_wait() {
        let mut recorders = vec![
            StubRecorder::new(1, 0xA),
            StubRecorder::new(2, 0xB),
            StubRecorder::new(3, 0xC),
        ];

        let descs = build_submit_chain(&mut recorders, None).unwrap();
        assert_eq!(descs.len(), 3);

        assert!(descs[0].wait_semaphores.is_empty());
        assert_eq!(descs[0].signal_semaphores, vec![vk::Semaphore::from_raw(0xA)]);

        assert_eq!(descs[1].wait_semaphores, vec![vk::Semaphore::from_raw(0xA)]);
        assert_eq!(
            descs[1].wait_stages,
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
        );
        assert_eq!(descs[1].signal_semaphores, vec![vk::Semaphore::from_raw(0xB)]);

        assert_eq!(descs[2].wait_semaphores, vec![vk::Semaphore::from_raw(0xB)]);
        // Nothing downstream of the last submission: no signal, and its
        // semaphore was never created.
        assert!(descs[2].signal_semaphores.is_empty());
        assert_eq!(recorders[2].signal_requests, 0);
    }

    #[test]
    fn injected_waits_follow_the_chain_wait() {
        let extra = vk::Semaphore::from_raw(0xE);
        let mut recorders = vec![StubRecorder::new(1, 0xA), StubRecorder::new(2, 0xB)];
        recorders[1]
            .waits
            .push((extra, vk::PipelineStageFlags::TRANSFER));

        let descs = build_submit_chain(&mut recorders, None).unwrap();
        assert_eq!(
            descs[1].wait_semaphores,
            vec![vk::Semaphore::from_raw(0xA), extra]
        );
        assert_eq!(
            descs[1].wait_stages,
            vec![
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::TRANSFER
            ]
        );

        // Waits were consumed; rebuilding the chain injects nothing.
        let descs = build_submit_chain(&mut recorders, None).unwrap();
        assert_eq!(descs[1].wait_semaphores, vec![vk::Semaphore::from_raw(0xA)]);
    }

    #[test]
    fn present_hooks_couple_the_last_submission() {
        let hooks = PresentHooks {
            acquire_semaphore: vk::Semaphore::from_raw(0x10),
            acquire_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            render_done: vk::Semaphore::from_raw(0x11),
        };
        let mut recorders = vec![StubRecorder::new(1, 0xA), StubRecorder::new(2, 0xB)];

        let descs = build_submit_chain(&mut recorders, Some(&hooks)).unwrap();

        // Only the final submission touches the swapchain semaphores.
        assert_eq!(descs[0].signal_semaphores, vec![vk::Semaphore::from_raw(0xA)]);
        assert_eq!(
            descs[1].wait_semaphores,
            vec![vk::Semaphore::from_raw(0xA), vk::Semaphore::from_raw(0x10)]
        );
        assert_eq!(
            descs[1].wait_stages[1],
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            descs[1].signal_semaphores,
            vec![vk::Semaphore::from_raw(0x11)]
        );
        assert_eq!(recorders[1].signal_requests, 0);
    }

    #[test]
    fn single_submission_without_present_gets_no_semaphores() {
        let mut recorders = vec![StubRecorder::new(1, 0xA)];
        let descs = build_submit_chain(&mut recorders, None).unwrap();
        assert!(descs[0].wait_semaphores.is_empty());
        assert!(descs[0].signal_semaphores.is_empty());
        assert_eq!(recorders[0].signal_requests, 0);
    }

    #[test]
    fn wait_on_own_signal_is_rejected() {
        // The injected wait aliases the semaphore this submission will
        // signal for the next one.
        let mut recorders = vec![StubRecorder::new(1, 0xA), StubRecorder::new(2, 0xB)];
        recorders[0].waits.push((
            vk::Semaphore::from_raw(0xA),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ));

        let result = build_submit_chain(&mut recorders, None);
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn empty_batch_builds_empty_chain() {
        let mut recorders: Vec<StubRecorder> = Vec::new();
        let descs = build_submit_chain(&mut recorders, None).unwrap();
        assert!(descs.is_empty());
    }
}
