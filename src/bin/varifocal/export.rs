use crate::{config::ExportFormat, metrics::mean};
use image::{ImageBuffer, ImageFormat, Rgb};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("expected {expected} values for a {width}x{height} RGB image, got {len}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        len: usize,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Saves an interleaved RGB image with values in `[0, 1]`; out of range values are clipped.
pub fn save_rgb(
    rgb: &[f32],
    width: u32,
    height: u32,
    format: ExportFormat,
    path: impl AsRef<Path>,
) -> Result<(), ExportError> {
    let expected = (width * height * 3) as usize;
    if rgb.len() != expected {
        return Err(ExportError::BufferSize {
            width,
            height,
            expected,
            len: rgb.len(),
        });
    }

    match format {
        ExportFormat::Tiff16 => {
            let data = rgb
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 65535.0).round() as u16)
                .collect();
            let image = ImageBuffer::<Rgb<u16>, Vec<u16>>::from_raw(width, height, data)
                .ok_or(ExportError::BufferSize {
                    width,
                    height,
                    expected,
                    len: rgb.len(),
                })?;
            image.save_with_format(path, ImageFormat::Tiff)?;
        }
        ExportFormat::Png8 => {
            let data = rgb
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect();
            let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, data)
                .ok_or(ExportError::BufferSize {
                    width,
                    height,
                    expected,
                    len: rgb.len(),
                })?;
            image.save_with_format(path, ImageFormat::Png)?;
        }
    }

    Ok(())
}

fn write_header(out: &mut impl Write, header: &str) -> std::io::Result<()> {
    writeln!(out, "# ")?;
    writeln!(out, "# {}", header)
}

/// Writes per-image quality values, one row of focal planes per focal stack, preceded by
/// the overall mean and the mean of every stack.
pub fn write_quality_report(
    path: impl AsRef<Path>,
    metric: &str,
    rows: &[Vec<f64>],
) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    let all: Vec<f64> = rows.iter().flatten().copied().collect();

    write_header(&mut out, &format!("mean {} for all test images", metric))?;
    writeln!(out, "{:.4}", mean(&all))?;

    write_header(&mut out, &format!("mean {} for each focal stack", metric))?;
    for row in rows {
        writeln!(out, "{:.4}", mean(row))?;
    }

    write_header(&mut out, &format!("{} for each individual image", metric))?;
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiff_is_sixteen_bit_and_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.tiff");
        let rgb = [0.0, 0.5, 1.0, -0.2, 1.7, 0.25];
        save_rgb(&rgb, 2, 1, ExportFormat::Tiff16, &path).unwrap();

        let image = image::open(&path).unwrap().to_rgb16();
        assert_eq!(image.get_pixel(0, 0).0, [0, 32768, 65535]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 65535, 16384]);
    }

    #[test]
    fn test_png_is_eight_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.png");
        save_rgb(&[1.0, 0.0, 0.5], 1, 1, ExportFormat::Png8, &path).unwrap();

        let image = image::open(&path).unwrap();
        assert_eq!(image.color(), image::ColorType::Rgb8);
        assert_eq!(image.to_rgb8().get_pixel(0, 0).0, [255, 0, 128]);
    }

    #[test]
    fn test_rejects_short_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let result = save_rgb(&[0.0; 5], 1, 2, ExportFormat::Png8, dir.path().join("x.png"));
        assert!(matches!(result, Err(ExportError::BufferSize { expected: 6, .. })));
    }

    #[test]
    fn test_quality_report_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_PSNRs.txt");
        write_quality_report(&path, "PSNR", &[vec![30.0, 32.0], vec![40.0, 42.0]]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let expected = "\
# 
# mean PSNR for all test images
36.0000
# 
# mean PSNR for each focal stack
31.0000
41.0000
# 
# PSNR for each individual image
30.0000 32.0000
40.0000 42.0000
";
        assert_eq!(text, expected);
    }
}
