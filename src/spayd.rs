//! Short Payment Descriptor encoding and QR rendering.
//!
//! Builds the `SPD*1.0*...` payment-request string banking apps scan, with
//! the fixed field order the format mandates, and renders it into a PNG QR
//! code. Everything here is pure and deterministic: same input, same
//! string, same pixels. No state, no network.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Luma};
use qrcode::{Color, QrCode};

use crate::error::{EngineError, EngineResult};
use crate::money::Money;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to the encoder. `account` is the recipient bank account in IBAN
/// form; the optional fields become `RN`, `MSG` and `X-VS` segments.
#[derive(Debug, Clone)]
pub struct PaymentRequest<'a> {
    pub account: &'a str,
    pub amount: Money,
    pub currency: &'a str,
    pub recipient_name: Option<&'a str>,
    pub message: Option<&'a str>,
    pub variable_symbol: Option<&'a str>,
}

/// Fat-finger guard for request amounts. Not a business rule, just a sanity
/// window so a mistyped amount cannot produce a scannable request for a
/// month of revenue.
#[derive(Debug, Clone, Copy)]
pub struct AmountLimits {
    pub min: Money,
    pub max: Money,
}

impl Default for AmountLimits {
    fn default() -> Self {
        AmountLimits {
            min: Money::from_minor(100),
            max: Money::from_minor(50_000_000),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a payment request into its wire string.
///
/// Field order is fixed by the scanning-app convention: `SPD*1.0`, then
/// `ACC`, `AM`, `CC`, then the optional `RN`, `MSG`, `X-VS` segments in
/// that order. Reordering breaks real-world readers, so nothing here is
/// configurable.
pub fn encode(request: &PaymentRequest<'_>, limits: &AmountLimits) -> EngineResult<String> {
    let account = request.account.trim();
    if account.is_empty() {
        return Err(EngineError::validation("recipient account must not be empty"));
    }
    if account.contains('*') || account.chars().any(char::is_whitespace) {
        return Err(EngineError::validation(
            "recipient account contains invalid characters",
        ));
    }

    let currency = request.currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EngineError::validation(format!(
            "currency must be a 3-letter code, got {currency:?}"
        )));
    }

    if !request.amount.is_positive() {
        return Err(EngineError::validation("request amount must be positive"));
    }
    if request.amount < limits.min || request.amount > limits.max {
        return Err(EngineError::validation(format!(
            "request amount {} is outside the allowed range {} to {}",
            request.amount.format_major(),
            limits.min.format_major(),
            limits.max.format_major()
        )));
    }

    if let Some(vs) = request.variable_symbol {
        if vs.is_empty() || vs.len() > 10 || !vs.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::validation(format!(
                "variable symbol must be 1-10 digits, got {vs:?}"
            )));
        }
    }

    let mut out = format!(
        "SPD*1.0*ACC:{}*AM:{}*CC:{}",
        account,
        request.amount.format_major(),
        currency.to_ascii_uppercase()
    );
    if let Some(name) = request.recipient_name {
        if !name.trim().is_empty() {
            out.push_str("*RN:");
            out.push_str(&escape(name.trim()));
        }
    }
    if let Some(message) = request.message {
        if !message.trim().is_empty() {
            out.push_str("*MSG:");
            out.push_str(&escape(message.trim()));
        }
    }
    if let Some(vs) = request.variable_symbol {
        out.push_str("*X-VS:");
        out.push_str(vs);
    }

    Ok(out)
}

/// Percent-escape a segment value. Unreserved characters pass through,
/// everything else (including `*`, which would split the segment) becomes
/// uppercase `%XX` per UTF-8 byte.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// QR rendering
// ---------------------------------------------------------------------------

/// Pixels per QR module.
const QR_SCALE: usize = 8;
/// Quiet-zone width in modules on each side, per the QR standard.
const QR_QUIET: usize = 4;

/// Render a string as a PNG QR code (grayscale, scaled, with quiet zone).
pub fn qr_png(data: &str) -> EngineResult<Vec<u8>> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| EngineError::Internal(format!("QR encoding failed: {e}")))?;
    let width = code.width();
    let modules = code.to_colors();

    let side = (width + 2 * QR_QUIET) * QR_SCALE;
    let mut img: ImageBuffer<Luma<u8>, Vec<u8>> =
        ImageBuffer::from_pixel(side as u32, side as u32, Luma([255u8]));

    for y in 0..width {
        for x in 0..width {
            if modules[y * width + x] == Color::Dark {
                let x0 = (x + QR_QUIET) * QR_SCALE;
                let y0 = (y + QR_QUIET) * QR_SCALE;
                for dy in 0..QR_SCALE {
                    for dx in 0..QR_SCALE {
                        img.put_pixel((x0 + dx) as u32, (y0 + dy) as u32, Luma([0u8]));
                    }
                }
            }
        }
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(img.as_raw(), side as u32, side as u32, ExtendedColorType::L8)
        .map_err(|e| EngineError::Internal(format!("PNG encoding failed: {e}")))?;
    Ok(png)
}

/// The QR code as a `data:` URI, ready for an `<img>` tag or a webview.
pub fn qr_data_uri(data: &str) -> EngineResult<String> {
    Ok(format!("data:image/png;base64,{}", BASE64.encode(qr_png(data)?)))
}

// ===========================================================================
// Tests
// ===========================================================================
