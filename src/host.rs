// Minimal native host for the probe: a plain window, optionally with a
// DirectComposition visual that shows a composition swap chain.

use crate::backend::{NativeWindow, RawHandle};
use crate::{log_info, log_warn};
use anyhow::{Context, Result};
use windows::{
    core::*,
    Win32::{
        Foundation::*,
        Graphics::DirectComposition::*,
        UI::WindowsAndMessaging::*,
    },
};

struct Composition {
    device: IDCompositionDevice,
    #[allow(dead_code)]
    target: IDCompositionTarget,
    visual: IDCompositionVisual,
}

pub struct PreviewWindow {
    hwnd: HWND,
    composition: Option<Composition>,
}

impl PreviewWindow {
    /// Opens a window with a client area of `width` x `height`. With
    /// `composition` set, a visual is prepared for a composition swap chain.
    pub fn open(width: u32, height: u32, composition: bool) -> Result<Self> {
        unsafe {
            let hwnd = Self::create_window(width, height)?;

            let composition = if composition {
                let device: IDCompositionDevice =
                    DCompositionCreateDevice(None).context("Failed to create composition device")?;
                let target = device.CreateTargetForHwnd(hwnd, true)?;
                let visual = device.CreateVisual()?;
                target.SetRoot(&visual)?;
                device.Commit()?;
                Some(Composition { device, target, visual })
            } else {
                None
            };

            log_info!("Preview window opened ({}x{}, composition: {})", width, height, composition.is_some());
            Ok(Self { hwnd, composition })
        }
    }

    unsafe fn create_window(width: u32, height: u32) -> Result<HWND> {
        let class_name = w!("FramesharePreview");

        let hinstance = windows::Win32::System::LibraryLoader::GetModuleHandleW(None)?;

        let wc = WNDCLASSW {
            lpfnWndProc: Some(Self::window_proc),
            hInstance: hinstance.into(),
            lpszClassName: class_name,
            style: CS_HREDRAW | CS_VREDRAW,
            ..Default::default()
        };

        RegisterClassW(&wc);

        // Grow the outer rectangle so the client area gets the requested size
        let mut rect = RECT {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        };
        let _ = AdjustWindowRectEx(&mut rect, WS_OVERLAPPEDWINDOW, false, WINDOW_EX_STYLE(0));

        let hwnd = CreateWindowExW(
            WINDOW_EX_STYLE(0),
            class_name,
            w!("frameshare probe"),
            WS_OVERLAPPEDWINDOW,
            CW_USEDEFAULT,
            CW_USEDEFAULT,
            rect.right - rect.left,
            rect.bottom - rect.top,
            None,
            None,
            Some(HINSTANCE(hinstance.0)),
            None,
        )?;

        let _ = ShowWindow(hwnd, SW_SHOW);

        Ok(hwnd)
    }

    unsafe extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        match msg {
            WM_DESTROY => {
                PostQuitMessage(0);
                LRESULT(0)
            }
            _ => DefWindowProcW(hwnd, msg, wparam, lparam),
        }
    }

    pub fn window(&self) -> NativeWindow {
        NativeWindow(self.hwnd.0 as isize)
    }

    pub fn client_size(&self) -> (u32, u32) {
        let mut rect = RECT::default();
        unsafe {
            if GetClientRect(self.hwnd, &mut rect).is_err() {
                return (0, 0);
            }
        }
        ((rect.right - rect.left).max(0) as u32, (rect.bottom - rect.top).max(0) as u32)
    }

    /// Shows the swap chain behind `swap_chain` in the window.
    pub fn attach_swap_chain(&self, swap_chain: RawHandle) -> Result<()> {
        let Some(composition) = &self.composition else {
            return Ok(());
        };
        if swap_chain.is_null() {
            anyhow::bail!("no swap chain to attach");
        }
        unsafe {
            let raw = swap_chain.as_ptr();
            let content = IUnknown::from_raw_borrowed(&raw).context("swap chain pointer is not a COM object")?;
            composition.visual.SetContent(content)?;
            composition.device.Commit()?;
        }
        Ok(())
    }

    /// Drops the visual's reference to the swap chain. Must happen before
    /// the session releases it.
    pub fn detach_swap_chain(&self) -> Result<()> {
        if let Some(composition) = &self.composition {
            unsafe {
                composition.visual.SetContent(None::<&IUnknown>)?;
                composition.device.Commit()?;
            }
        }
        Ok(())
    }

    /// Drains pending window messages. Returns `false` once the window has
    /// been closed.
    pub fn pump_messages(&self) -> bool {
        let mut msg = MSG::default();
        unsafe {
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                if msg.message == WM_QUIT {
                    return false;
                }
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
        true
    }
}

impl Drop for PreviewWindow {
    fn drop(&mut self) {
        if let Err(e) = self.detach_swap_chain() {
            log_warn!("Failed to detach swap chain: {}", e);
        }
        self.composition = None;
        unsafe {
            let _ = DestroyWindow(self.hwnd);
        }
    }
}
