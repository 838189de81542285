//! Non-interactive "zip everything" mode: walks the whole mounted tree and
//! writes it into a single zip archive.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike};
use log::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use efs2::fs::{Filesystem, OpenResult};
use efs2::inode::is_dir;

pub fn dump_all(fs: &Filesystem, out_path: &Path) -> Result<()> {
    let file = File::create(out_path).with_context(|| format!("creating {}", out_path.display()))?;
    let mut zf = ZipWriter::new(file);

    for (name, inode) in fs.ls_recursive("/")? {
        info!("{name}");

        let attempt = (|| -> Result<()> {
            let zip_name = name.trim_start_matches('/');

            let (y, mo, d, h, mi, s) = inode
                .modified_time
                .filter(|t| t.year() >= 1980)
                .map(|t| (t.year() as u16, t.month() as u8, t.day() as u8, t.hour() as u8, t.minute() as u8, t.second() as u8))
                .unwrap_or((1980, 1, 1, 0, 0, 0));
            let date_time = zip::DateTime::from_date_and_time(y, mo, d, h, mi, s).unwrap_or_else(|_| zip::DateTime::default());

            let options = FileOptions::default().compression_method(CompressionMethod::Deflated).last_modified_time(date_time);

            if is_dir(inode.mode) {
                zf.add_directory(format!("{zip_name}/"), options)?;
            } else {
                zf.start_file(zip_name, options)?;
                match fs.open(&name, false)? {
                    OpenResult::File(mut r) => {
                        let mut buf = Vec::new();
                        r.read_to_end(&mut buf)?;
                        zf.write_all(&buf)?;
                    }
                    OpenResult::SymlinkTarget(data) => {
                        zf.write_all(&data)?;
                    }
                }
            }
            Ok(())
        })();

        if let Err(e) = attempt {
            warn!("{name}: {e}");
        }
    }

    zf.finish()?;
    Ok(())
}
