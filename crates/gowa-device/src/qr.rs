//! Pairing QR artifacts.

use gowa_core::GatewayError;
use image::{ImageBuffer, Luma};
use qrcode::{Color, EcLevel, QrCode};

/// Render pairing data as PNG bytes for transport in a JSON response.
pub fn generate_qr_png(data: &str) -> Result<Vec<u8>, GatewayError> {
    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L)
        .map_err(|e| GatewayError::Transport(format!("qr generation failed: {e}")))?;

    let module_px: u32 = 8;
    let quiet: u32 = 4;
    let modules = code.width() as u32;
    let size = (modules + quiet * 2) * module_px;

    let img = ImageBuffer::from_fn(size, size, |x, y| {
        let mx = x / module_px;
        let my = y / module_px;
        let inside = mx >= quiet && my >= quiet && mx < modules + quiet && my < modules + quiet;
        if inside && code[((mx - quiet) as usize, (my - quiet) as usize)] == Color::Dark {
            Luma([0u8])
        } else {
            Luma([255u8])
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| GatewayError::Transport(format!("png encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

/// Compact terminal rendering: two module rows per text line using
/// half-block characters.
pub fn generate_qr_terminal(data: &str) -> Result<String, GatewayError> {
    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L)
        .map_err(|e| GatewayError::Transport(format!("qr generation failed: {e}")))?;

    let width = code.width();
    let colors: Vec<Color> = code.into_colors();
    let dark = |row: usize, col: usize| {
        row < width && col < width && colors[row * width + col] == Color::Dark
    };

    let mut out = String::new();
    for row in (0..width).step_by(2) {
        for col in 0..width {
            let glyph = match (dark(row, col), dark(row + 1, col)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            };
            out.push(glyph);
        }
        out.push('\n');
    }
    Ok(out)
}
