// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Binary checkpoint format for visibility datasets.
//!
//! Every pipeline stage writes its output dataset to disk so that a failed
//! run can be restarted from the last good checkpoint. The format is a
//! little-endian dump of the in-memory dataset, magic-tagged and versioned.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hifitime::Epoch;
use marlu::{c32, RADec, UVW};
use ndarray::prelude::*;
use thiserror::Error;
use vec1::Vec1;

use super::{Antenna, SpectralWindow, SpwData, SpwIntent, VisDataset};

const MAGIC: &[u8; 8] = b"ASCVIS01";

#[derive(Debug, Error)]
pub enum ReadDatasetError {
    #[error("{file}: doesn't appear to be a dataset checkpoint (bad magic)")]
    BadMagic { file: String },

    #[error("{file}: bad {what} in dataset checkpoint")]
    BadValue { file: String, what: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteDatasetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn write_string(out: &mut impl Write, s: &str) -> Result<(), std::io::Error> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.write_all(s.as_bytes())
}

fn read_string(inp: &mut impl Read, file: &str) -> Result<String, ReadDatasetError> {
    let len = inp.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    inp.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| ReadDatasetError::BadValue {
        file: file.to_string(),
        what: "string",
    })
}

fn write_complex_array(
    out: &mut impl Write,
    arr: Option<&Array3<c32>>,
) -> Result<(), std::io::Error> {
    match arr {
        None => out.write_u8(0),
        Some(arr) => {
            out.write_u8(1)?;
            for v in arr.iter() {
                out.write_f32::<LittleEndian>(v.re)?;
                out.write_f32::<LittleEndian>(v.im)?;
            }
            Ok(())
        }
    }
}

fn read_complex_array(
    inp: &mut impl Read,
    dim: (usize, usize, usize),
) -> Result<Option<Array3<c32>>, ReadDatasetError> {
    match inp.read_u8()? {
        0 => Ok(None),
        _ => {
            let mut arr = Array3::zeros(dim);
            for v in arr.iter_mut() {
                let re = inp.read_f32::<LittleEndian>()?;
                let im = inp.read_f32::<LittleEndian>()?;
                *v = c32::new(re, im);
            }
            Ok(Some(arr))
        }
    }
}

/// Write a dataset checkpoint.
pub fn write_dataset<P: AsRef<Path>>(
    ds: &VisDataset,
    path: P,
) -> Result<(), WriteDatasetError> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;

    write_string(&mut out, &ds.name)?;
    out.write_f64::<LittleEndian>(ds.phase_centre.ra)?;
    out.write_f64::<LittleEndian>(ds.phase_centre.dec)?;

    out.write_u32::<LittleEndian>(ds.antennas.len() as u32)?;
    for ant in &ds.antennas {
        write_string(&mut out, &ant.name)?;
        write_string(&mut out, &ant.station)?;
        for p in ant.position_enu_m {
            out.write_f64::<LittleEndian>(p)?;
        }
    }

    out.write_u32::<LittleEndian>(ds.baselines.len() as u32)?;
    for &(a1, a2) in &ds.baselines {
        out.write_u32::<LittleEndian>(a1 as u32)?;
        out.write_u32::<LittleEndian>(a2 as u32)?;
    }

    out.write_u32::<LittleEndian>(ds.timestamps.len() as u32)?;
    for t in &ds.timestamps {
        out.write_f64::<LittleEndian>(t.to_gpst_seconds())?;
    }

    out.write_u32::<LittleEndian>(ds.scans.len() as u32)?;
    for scan in &ds.scans {
        out.write_u32::<LittleEndian>(scan.start as u32)?;
        out.write_u32::<LittleEndian>(scan.end as u32)?;
    }

    for uvw in ds.uvws_m.iter() {
        out.write_f64::<LittleEndian>(uvw.u)?;
        out.write_f64::<LittleEndian>(uvw.v)?;
        out.write_f64::<LittleEndian>(uvw.w)?;
    }

    out.write_u32::<LittleEndian>(ds.spws.len() as u32)?;
    for (spw, sd) in ds.spws.iter().zip(ds.spw_data.iter()) {
        write_string(&mut out, &spw.source_eb)?;
        out.write_f64::<LittleEndian>(spw.first_freq_hz)?;
        out.write_f64::<LittleEndian>(spw.chan_width_hz)?;
        out.write_u32::<LittleEndian>(spw.num_chans as u32)?;
        out.write_u8(match spw.intent {
            SpwIntent::Continuum => 0,
            SpwIntent::Line => 1,
        })?;

        write_complex_array(&mut out, Some(&sd.data))?;
        write_complex_array(&mut out, sd.corrected.as_ref())?;
        write_complex_array(&mut out, sd.model.as_ref())?;
        for w in sd.weights.iter() {
            out.write_f32::<LittleEndian>(*w)?;
        }
        for f in sd.flags.iter() {
            out.write_u8(u8::from(*f))?;
        }
    }

    out.write_u32::<LittleEndian>(ds.history.len() as u32)?;
    for h in &ds.history {
        write_string(&mut out, h)?;
    }

    Ok(())
}

/// Read a dataset checkpoint.
pub fn read_dataset<P: AsRef<Path>>(path: P) -> Result<VisDataset, ReadDatasetError> {
    let file_str = path.as_ref().display().to_string();
    let mut inp = BufReader::new(File::open(&path)?);

    let mut magic = [0u8; 8];
    inp.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ReadDatasetError::BadMagic { file: file_str });
    }

    let name = read_string(&mut inp, &file_str)?;
    let ra = inp.read_f64::<LittleEndian>()?;
    let dec = inp.read_f64::<LittleEndian>()?;
    let phase_centre = RADec::from_radians(ra, dec);

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

    let num_bls = inp.read_u32::<LittleEndian>()? as usize;
    let mut baselines = Vec::with_capacity(num_bls);
    for _ in 0..num_bls {
        let a1 = inp.read_u32::<LittleEndian>()? as usize;
        let a2 = inp.read_u32::<LittleEndian>()? as usize;
        baselines.push((a1, a2));
    }

    let num_times = inp.read_u32::<LittleEndian>()? as usize;
    let mut timestamps = Vec::with_capacity(num_times);
    for _ in 0..num_times {
        timestamps.push(Epoch::from_gpst_seconds(inp.read_f64::<LittleEndian>()?));
    }
    let timestamps = Vec1::try_from_vec(timestamps).map_err(|_| ReadDatasetError::BadValue {
        file: file_str.clone(),
        what: "empty timestamp list",
    })?;

    let num_scans = inp.read_u32::<LittleEndian>()? as usize;
    let mut scans: Vec<Range<usize>> = Vec::with_capacity(num_scans);
    for _ in 0..num_scans {
        let start = inp.read_u32::<LittleEndian>()? as usize;
        let end = inp.read_u32::<LittleEndian>()? as usize;
        scans.push(start..end);
    }

    let mut uvws_m = Array2::from_elem((num_times, num_bls), UVW::default());
    for uvw in uvws_m.iter_mut() {
        uvw.u = inp.read_f64::<LittleEndian>()?;
        uvw.v = inp.read_f64::<LittleEndian>()?;
        uvw.w = inp.read_f64::<LittleEndian>()?;
    }

    let num_spws = inp.read_u32::<LittleEndian>()? as usize;
    let mut spws = Vec::with_capacity(num_spws);
    let mut spw_data = Vec::with_capacity(num_spws);
    for id in 0..num_spws {
        let source_eb = read_string(&mut inp, &file_str)?;
        let first_freq_hz = inp.read_f64::<LittleEndian>()?;
        let chan_width_hz = inp.read_f64::<LittleEndian>()?;
        let num_chans = inp.read_u32::<LittleEndian>()? as usize;
        let intent = match inp.read_u8()? {
            0 => SpwIntent::Continuum,
            1 => SpwIntent::Line,
            _ => {
                return Err(ReadDatasetError::BadValue {
                    file: file_str.clone(),
                    what: "spw intent",
                })
            }
        };
        let dim = (num_times, num_bls, num_chans);

        let data = read_complex_array(&mut inp, dim)?.ok_or(ReadDatasetError::BadValue {
            file: file_str.clone(),
            what: "missing data column",
        })?;
        let corrected = read_complex_array(&mut inp, dim)?;
        let model = read_complex_array(&mut inp, dim)?;
        let mut weights = Array3::zeros(dim);
        for w in weights.iter_mut() {
            *w = inp.read_f32::<LittleEndian>()?;
        }
        let mut flags = Array3::from_elem(dim, false);
        for f in flags.iter_mut() {
            *f = inp.read_u8()? != 0;
        }

        spws.push(SpectralWindow {
            id,
            source_eb,
            first_freq_hz,
            chan_width_hz,
            num_chans,
            intent,
        });
        spw_data.push(SpwData {
            data,
            corrected,
            model,
            weights,
            flags,
        });
    }

    let num_history = inp.read_u32::<LittleEndian>()? as usize;
    let mut history = Vec::with_capacity(num_history);
    for _ in 0..num_history {
        history.push(read_string(&mut inp, &file_str)?);
    }

    Ok(VisDataset {
        name,
        phase_centre,
        antennas,
        baselines,
        timestamps,
        scans,
        uvws_m,
        spws,
        spw_data,
        history,
    })
}
