//! Sketch info command: parse and paginate without any device I/O.

use {
    crate::config::Config,
    anyhow::{Context, Result},
    console::style,
    sketchlink::{DEFAULT_PAGE_SIZE, HexOptions, Sketch},
    std::path::Path,
};

/// Parse `path` with the page size and checksum mode from flags or config.
pub(crate) fn load_sketch(
    config: &Config,
    path: &Path,
    page_size: usize,
    strict_checksum: bool,
) -> Result<Sketch> {
    let options = HexOptions {
        strict_checksum: strict_checksum || config.upload.strict_checksum,
    };
    Sketch::from_hex_file(path, page_size, options)
        .with_context(|| format!("Failed to load sketch {}", path.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(
    config: &Config,
    path: &Path,
    page_size: Option<usize>,
    strict_checksum: bool,
    json: bool,
) -> Result<()> {
    let page_size = page_size
        .or(config.upload.page_size)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let sketch = load_sketch(config, path, page_size, strict_checksum)?;

    if json {
        return print_info_json(path, &sketch);
    }

    let info = sketch.info();
    eprintln!(
        "{}",
        style("Sketch Information")
            .bold()
            .underlined()
    );
    eprintln!("  File:   {}", path.display());
    eprintln!("  Size:   {} bytes", info.size);
    eprintln!(
        "  Pages:  {} x {} bytes (last page {} bytes)",
        info.pages, info.bytes_per_page, info.last_page_len
    );
    eprintln!("  CRC16:  {:04X}", info.crc16);

    eprintln!(
        "\n{}",
        style("Pages")
            .bold()
            .underlined()
    );
    for page in sketch.pages() {
        eprintln!(
            "  [{:3}] word {} byte {:#06x} {:3} bytes",
            page.ordinal,
            style(format!("{:#06x}", page.word_address)).cyan(),
            page.byte_address,
            page.len()
        );
    }

    Ok(())
}

/// Info command `--json` output: structured JSON to stdout.
fn print_info_json(path: &Path, sketch: &Sketch) -> Result<()> {
    let pages: Vec<serde_json::Value> = sketch
        .pages()
        .iter()
        .map(|page| {
            serde_json::json!({
                "ordinal": page.ordinal,
                "byte_address": page.byte_address,
                "word_address": page.word_address,
                "len": page.len(),
            })
        })
        .collect();

    let output = serde_json::json!({
        "ok": true,
        "data": {
            "path": path.display().to_string(),
            "sketch": sketch.info(),
            "pages": pages,
        }
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
