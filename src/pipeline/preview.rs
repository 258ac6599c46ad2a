use std::{
    cell::RefCell,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use image::RgbaImage;
use minifb::{Key, Window, WindowOptions};

/// Native window showing the annotated video stream.
struct PreviewWindow {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
    generation: u64,
}

impl PreviewWindow {
    fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )
        .context("failed to open preview window")?;

        Ok(Self {
            window,
            buffer: vec![0u32; width * height],
            width,
            height,
            generation: GENERATION.load(Ordering::SeqCst),
        })
    }

    fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    fn present(&mut self, image: &RgbaImage) -> Result<()> {
        for (dst, px) in self.buffer.iter_mut().zip(image.pixels()) {
            let [r, g, b, _] = px.0;
            *dst = ((r as u32) << 16) | ((g as u32) << 8) | b as u32;
        }
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)
            .context("failed to update preview window")?;
        Ok(())
    }
}

// minifb windows must stay on the thread that created them. Closing from
// another thread bumps the generation; stale windows are dropped by their
// own thread on its next `show`.
static GENERATION: AtomicU64 = AtomicU64::new(0);

fn is_current(generation: u64) -> bool {
    generation == GENERATION.load(Ordering::SeqCst)
}

thread_local! {
    static PREVIEW: RefCell<Option<PreviewWindow>> = const { RefCell::new(None) };
}

/// Shows `image` in this thread's preview window, opening or resizing it as
/// needed. Returns `false` once the user closed the window or pressed Escape.
pub fn show(title: &str, image: &RgbaImage) -> Result<bool> {
    PREVIEW.with(|slot| {
        let mut slot = slot.borrow_mut();
        let (width, height) = (image.width() as usize, image.height() as usize);

        let reopen = match slot.as_ref() {
            Some(preview) => {
                !is_current(preview.generation)
                    || preview.width != width
                    || preview.height != height
            }
            None => true,
        };
        if reopen {
            *slot = None;
            *slot = Some(PreviewWindow::new(title, width, height)?);
        }

        let Some(preview) = slot.as_mut() else {
            return Ok(false);
        };
        preview.present(image)?;
        if preview.is_open() {
            Ok(true)
        } else {
            *slot = None;
            Ok(false)
        }
    })
}

/// Closes this thread's preview window right away and marks windows owned by
/// other threads as stale.
pub fn close() {
    GENERATION.fetch_add(1, Ordering::SeqCst);
    PREVIEW.with(|slot| {
        if slot.borrow_mut().take().is_some() {
            log::debug!("preview window closed");
        }
    });
}
