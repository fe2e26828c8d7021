// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Binary read/write of gain tables. Little-endian, magic-tagged, in the
//! same mould as the dataset checkpoint format.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hifitime::Epoch;
use marlu::c64;
use ndarray::prelude::*;
use vec1::Vec1;

use super::{CalMode, GainTable, ReadSolutionsError, SpwBlock, Timeblock, WriteSolutionsError};
use crate::obs::Antenna;

const MAGIC: &[u8; 8] = b"ASCSOL01";

fn write_string(out: &mut impl Write, s: &str) -> Result<(), std::io::Error> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.write_all(s.as_bytes())
}

fn read_string(inp: &mut impl Read, file: &str) -> Result<String, ReadSolutionsError> {
    let len = inp.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    inp.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| ReadSolutionsError::BadValue {
        file: file.to_string(),
        what: "string",
    })
}

/// Write a gain table.
pub fn write_table<P: AsRef<Path>>(table: &GainTable, path: P) -> Result<(), WriteSolutionsError> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    write_string(&mut out, &table.name)?;
    write_string(&mut out, &table.mode.to_string())?;
    write_string(&mut out, &table.solved_from)?;
    write_string(&mut out, table.refant.as_deref().unwrap_or(""))?;

    out.write_u32::<LittleEndian>(table.antennas.len() as u32)?;
    for ant in &table.antennas {
        write_string(&mut out, &ant.name)?;
        write_string(&mut out, &ant.station)?;
        for p in ant.position_enu_m {
            out.write_f64::<LittleEndian>(p)?;
        }
    }

    out.write_u32::<LittleEndian>(table.timeblocks.len() as u32)?;
    for tb in &table.timeblocks {
        out.write_u32::<LittleEndian>(tb.range.start as u32)?;
        out.write_u32::<LittleEndian>(tb.range.end as u32)?;
        out.write_u32::<LittleEndian>(tb.timestamps.len() as u32)?;
        for ts in &tb.timestamps {
            out.write_f64::<LittleEndian>(ts.to_gpst_seconds())?;
        }
    }

    out.write_u32::<LittleEndian>(table.spwblocks.len() as u32)?;
    for sb in &table.spwblocks {
        out.write_u32::<LittleEndian>(sb.spw_ids.len() as u32)?;
        for &id in &sb.spw_ids {
            out.write_u32::<LittleEndian>(id as u32)?;
        }
        out.write_u32::<LittleEndian>(sb.source_ebs.len() as u32)?;
        for eb in &sb.source_ebs {
            write_string(&mut out, eb)?;
        }
        out.write_f64::<LittleEndian>(sb.centre_freq_hz)?;
    }

    for g in table.gains.iter() {
        out.write_f64::<LittleEndian>(g.re)?;
        out.write_f64::<LittleEndian>(g.im)?;
    }
    for s in table.snrs.iter() {
        out.write_f64::<LittleEndian>(*s)?;
    }
    Ok(())
}

/// Read a gain table.
pub fn read_table<P: AsRef<Path>>(path: P) -> Result<GainTable, ReadSolutionsError> {
    let file_str = path.as_ref().display().to_string();
    let mut inp = BufReader::new(File::open(&path)?);

    let mut magic = [0u8; 8];
    inp.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ReadSolutionsError::BadMagic { file: file_str });
    }

    let name = read_string(&mut inp, &file_str)?;
    let mode_str = read_string(&mut inp, &file_str)?;
    let mode = CalMode::from_str(&mode_str).map_err(|_| ReadSolutionsError::BadValue {
        file: file_str.clone(),
        what: "calibration mode",
    })?;
    let solved_from = read_string(&mut inp, &file_str)?;
    let refant_str = read_string(&mut inp, &file_str)?;
    let refant = (!refant_str.is_empty()).then_some(refant_str);

    let num_ants = inp.read_u32::<LittleEndian>()? as usize;
    let mut antennas = Vec::with_capacity(num_ants);
    for _ in 0..num_ants {
        let name = read_string(&mut inp, &file_str)?;
        let station = read_string(&mut inp, &file_str)?;
        let mut position_enu_m = [0.0; 3];
        for p in &mut position_enu_m {
            *p = inp.read_f64::<LittleEndian>()?;
        }
        antennas.push(Antenna {
            name,
            station,
            position_enu_m,
        });
    }

    let num_tbs = inp.read_u32::<LittleEndian>()? as usize;
    let mut timeblocks = Vec::with_capacity(num_tbs);
    for index in 0..num_tbs {
        let start = inp.read_u32::<LittleEndian>()? as usize;
        let end = inp.read_u32::<LittleEndian>()? as usize;
        let num_ts = inp.read_u32::<LittleEndian>()? as usize;
        let mut timestamps = Vec::with_capacity(num_ts);
        for _ in 0..num_ts {
            timestamps.push(Epoch::from_gpst_seconds(inp.read_f64::<LittleEndian>()?));
        }
        let median = timestamps[timestamps.len() / 2];
        timeblocks.push(Timeblock {
            index,
            range: start..end,
            timestamps: Vec1::try_from_vec(timestamps).map_err(|_| {
                ReadSolutionsError::BadValue {
                    file: file_str.clone(),
                    what: "empty timeblock",
                }
            })?,
            median,
        });
    }
    let timeblocks =
        Vec1::try_from_vec(timeblocks).map_err(|_| ReadSolutionsError::BadValue {
            file: file_str.clone(),
            what: "no timeblocks",
        })?;

    let num_sbs = inp.read_u32::<LittleEndian>()? as usize;
    let mut spwblocks = Vec::with_capacity(num_sbs);
    for index in 0..num_sbs {
        let num_ids = inp.read_u32::<LittleEndian>()? as usize;
        let mut spw_ids = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            spw_ids.push(inp.read_u32::<LittleEndian>()? as usize);
        }
        let num_ebs = inp.read_u32::<LittleEndian>()? as usize;
        let mut source_ebs = Vec::with_capacity(num_ebs);
        for _ in 0..num_ebs {
            source_ebs.push(read_string(&mut inp, &file_str)?);
        }
        let centre_freq_hz = inp.read_f64::<LittleEndian>()?;
        spwblocks.push(SpwBlock {
            index,
            spw_ids,
            source_ebs,
            centre_freq_hz,
        });
    }

    let dim = (timeblocks.len(), antennas.len(), spwblocks.len());
    let mut gains = Array3::zeros(dim);
    for g in gains.iter_mut() {
        let re = inp.read_f64::<LittleEndian>()?;
        let im = inp.read_f64::<LittleEndian>()?;
        *g = c64::new(re, im);
    }
    let mut snrs = Array3::zeros(dim);
    for s in snrs.iter_mut() {
        *s = inp.read_f64::<LittleEndian>()?;
    }

    Ok(GainTable {
        name,
        mode,
        antennas,
        timeblocks,
        spwblocks,
        gains,
        snrs,
        solved_from,
        refant,
    })
}
