//! CAD drawing to PDF conversion with vector fidelity via svg2pdf.
//!
//! This is the synchronous conversion capability the workers delegate to.
//! DXF drawings are rendered to SVG and converted with svg2pdf; DWG files
//! are first translated to DXF by the external `dwg2dxf` tool when it is
//! installed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dxf::{self, DxfError};

/// Failure of the conversion capability. The display text is the
/// diagnostic message reported to clients.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Unsupported format '{0}': only .dxf and .dwg drawings are accepted")]
    UnsupportedFormat(String),

    #[error("DWG direct conversion not available. Please convert to DXF format first.")]
    DwgUnavailable,

    #[error("DWG conversion failed: {0}")]
    Dwg(String),

    #[error("DXF conversion failed: {0}")]
    Dxf(#[from] DxfError),

    #[error("PDF rendering failed: {0}")]
    Render(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// A synchronous `convert(input, output)` capability.
pub trait Converter: Send + Sync {
    fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError>;
}

impl<F> Converter for F
where
    F: Fn(&Path, &Path) -> Result<(), ConvertError> + Send + Sync,
{
    fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        self(input, output)
    }
}

/// Where an in-progress PDF is written before being moved into place.
pub fn partial_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.pdf".to_string());
    output.with_file_name(format!(".{name}.partial"))
}

/// Drawing to PDF converter.
pub struct DrawingConverter {
    dwg2dxf: Option<PathBuf>,
}

impl DrawingConverter {
    /// Creates a converter, using `dwg2dxf` for DWG input if given.
    pub fn new(dwg2dxf: Option<PathBuf>) -> Self {
        Self { dwg2dxf }
    }

    /// Resolves the DWG tool from `DWG2DXF_PATH` or the `PATH`.
    pub fn from_env() -> Self {
        let tool = std::env::var_os("DWG2DXF_PATH")
            .map(PathBuf::from)
            .or_else(|| which::which("dwg2dxf").ok());
        match &tool {
            Some(path) => debug!(tool = %path.display(), "DWG support enabled"),
            None => debug!("dwg2dxf not found, DWG input will be rejected"),
        }
        Self::new(tool)
    }

    /// Renders an ASCII DXF file to PDF at `output_path`.
    ///
    /// # Errors
    ///
    /// - DXF parsing errors (binary files, malformed groups, no geometry)
    /// - SVG/PDF rendering errors
    /// - File I/O errors (permissions, disk full)
    pub fn convert_dxf(&self, dxf_path: &Path, output_path: &Path) -> Result<(), ConvertError> {
        info!("Converting DXF to PDF (VECTOR): input={}", dxf_path.display());

        let bytes = fs::read(dxf_path)
            .map_err(|e| ConvertError::io(format!("Failed to read {}", dxf_path.display()), e))?;
        let drawing = dxf::parse(&String::from_utf8_lossy(&bytes))?;
        if drawing.skipped > 0 {
            debug!(skipped = drawing.skipped, "Unsupported DXF entities skipped");
        }
        let svg = dxf::to_svg(&drawing)?;

        let mut options = usvg::Options::default();
        if drawing.has_text() {
            options.fontdb_mut().load_system_fonts();
        }
        let tree = usvg::Tree::from_str(&svg, &options)
            .map_err(|e| ConvertError::Render(format!("Failed to parse rendered SVG: {e}")))?;

        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(ConvertError::Render(format!(
                "Invalid drawing dimensions: {}x{}",
                size.width(),
                size.height()
            )));
        }

        let pdf_data = svg2pdf::to_pdf(
            &tree,
            svg2pdf::ConversionOptions::default(),
            svg2pdf::PageOptions::default(),
        );

        write_atomically(output_path, &pdf_data)?;

        info!(
            "PDF export complete (VECTOR): {} entities, {} bytes",
            drawing.entities.len(),
            pdf_data.len()
        );
        Ok(())
    }

    fn convert_dwg(&self, dwg_path: &Path, output_path: &Path) -> Result<(), ConvertError> {
        let Some(tool) = &self.dwg2dxf else {
            return Err(ConvertError::DwgUnavailable);
        };

        let scratch = std::env::temp_dir().join(format!(
            "dwg-converter-{}-{}.dxf",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        info!("Converting DWG to DXF: tool={}", tool.display());

        let output = Command::new(tool)
            .arg("-y")
            .arg("-o")
            .arg(&scratch)
            .arg(dwg_path)
            .output()
            .map_err(|e| ConvertError::Dwg(format!("failed to run {}: {e}", tool.display())))?;

        let result = if output.status.success() && scratch.exists() {
            self.convert_dxf(&scratch, output_path)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConvertError::Dwg(if stderr.trim().is_empty() {
                format!("{} exited with {}", tool.display(), output.status)
            } else {
                stderr.trim().to_string()
            }))
        };

        if let Err(e) = fs::remove_file(&scratch) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove scratch DXF {}: {}", scratch.display(), e);
            }
        }
        result
    }
}

impl Default for DrawingConverter {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Converter for DrawingConverter {
    /// Detects the input type by extension and converts accordingly.
    fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        let ext = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        match ext.as_str() {
            ".dxf" => self.convert_dxf(input, output),
            ".dwg" => self.convert_dwg(input, output),
            "" => Err(ConvertError::UnsupportedFormat("(none)".to_string())),
            _ => Err(ConvertError::UnsupportedFormat(ext)),
        }
    }
}

/// Writes `data` next to `output` and renames it into place.
fn write_atomically(output: &Path, data: &[u8]) -> Result<(), ConvertError> {
    let partial = partial_path(output);
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&partial)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&partial, output)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&partial);
        ConvertError::io(format!("Failed to write PDF to {}", output.display()), e)
    })
}
