use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_core::{ParleyError, ParleyResult};
use qrcode::render::svg;
use qrcode::QrCode;

/// Render a pairing payload as an SVG `data:` URI for the management UI.
pub fn qr_data_uri(payload: &str) -> ParleyResult<String> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| ParleyError::Gateway(format!("QR payload cannot be encoded: {e}")))?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_is_svg_data_uri() {
        let uri = qr_data_uri("2@Xk9a,bm9pc2U=,aWQ=,YWR2").unwrap();
        let encoded = uri.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }
}
