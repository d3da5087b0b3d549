//! §4.8 snapshot archive: a read-consistent zip of all public state,
//! built without locking by relying on every underlying file being
//! append-only and ordering the bundle by reverse modification
//! frequency (§4.8): a concurrent append can only extend a file already
//! captured earlier in the sequence.

use std::io::Write;
use std::path::Path;

use gca_core::error::{Error, Result};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::IoFailure(e.to_string())
}

/// Files are added in this order, from most to least frequently
/// modified, per §4.8.
pub struct SnapshotInputs<'a> {
    pub device_stats: &'a [u8],
    pub equipment_reports_path: &'a Path,
    pub equipment_authorizations_path: &'a Path,
    pub gca_pubkey_path: &'a Path,
    pub authorized_servers_path: &'a Path,
}

pub fn write_snapshot(out_path: &Path, inputs: SnapshotInputs) -> Result<()> {
    let file = std::fs::File::create(out_path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("device-stats.json", options).map_err(zip_err)?;
    zip.write_all(inputs.device_stats)?;

    add_file(&mut zip, options, "equipment-reports.dat", inputs.equipment_reports_path)?;
    add_file(
        &mut zip,
        options,
        "equipment-authorizations.dat",
        inputs.equipment_authorizations_path,
    )?;
    add_file(&mut zip, options, "gca.pubkey", inputs.gca_pubkey_path)?;
    add_file(&mut zip, options, "authorized-servers.dat", inputs.authorized_servers_path)?;

    zip.finish().map_err(zip_err)?;
    Ok(())
}

fn add_file(
    zip: &mut ZipWriter<std::fs::File>,
    options: SimpleFileOptions,
    name: &str,
    path: &Path,
) -> Result<()> {
    zip.start_file(name, options).map_err(zip_err)?;
    if path.exists() {
        let bytes = std::fs::read(path)?;
        zip.write_all(&bytes)?;
    }
    Ok(())
}
