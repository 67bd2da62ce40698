//! NetCDF-3 writer for data assemblies.
//!
//! Files use the classic layout with 64-bit offsets (CDF-2): a big-endian
//! header listing dimensions, attributes and variables, followed by each
//! variable's data padded to four bytes. There is no record dimension.
//!
//! The layout follows what xarray produces for a `DataArray`: the values live
//! in `__xarray_dataarray_variable__`, non-index coordinates are listed in its
//! `coordinates` attribute, and text coordinates become character arrays with
//! a trailing `string<N>` dimension and `_Encoding = "utf-8"`.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::assembly::{CoordValues, DataAssembly};
use crate::error::PackagingError;

pub const DATA_VARIABLE: &str = "__xarray_dataarray_variable__";

const MAGIC: &[u8; 4] = b"CDF\x02";
const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;
const NC_CHAR: u32 = 2;
const NC_INT: u32 = 4;
const NC_DOUBLE: u32 = 6;

#[derive(Debug, Clone, PartialEq)]
enum Data {
    Char(Vec<u8>),
    Int(Vec<i32>),
    Double(Vec<f64>),
}

impl Data {
    fn nc_type(&self) -> u32 {
        match self {
            Data::Char(_) => NC_CHAR,
            Data::Int(_) => NC_INT,
            Data::Double(_) => NC_DOUBLE,
        }
    }

    fn len(&self) -> usize {
        match self {
            Data::Char(bytes) => bytes.len(),
            Data::Int(values) => values.len(),
            Data::Double(values) => values.len(),
        }
    }

    fn byte_len(&self) -> u64 {
        match self {
            Data::Char(bytes) => bytes.len() as u64,
            Data::Int(values) => values.len() as u64 * 4,
            Data::Double(values) => values.len() as u64 * 8,
        }
    }

    fn write_padded(&self, out: &mut impl Write) -> std::io::Result<()> {
        match self {
            Data::Char(bytes) => out.write_all(bytes)?,
            Data::Int(values) => {
                for value in values {
                    out.write_all(&value.to_be_bytes())?;
                }
            }
            Data::Double(values) => {
                for value in values {
                    out.write_all(&value.to_be_bytes())?;
                }
            }
        }
        out.write_all(&[0u8; 3][..padding(self.byte_len())])
    }
}

#[derive(Debug)]
struct Variable {
    name: String,
    dim_ids: Vec<usize>,
    attrs: Vec<(String, Data)>,
    data: Data,
}

#[derive(Debug, Default)]
struct NcFile {
    dims: Vec<(String, u32)>,
    vars: Vec<Variable>,
}

impl NcFile {
    fn existing_dim(&self, name: &str) -> Result<usize, PackagingError> {
        self.dims
            .iter()
            .position(|(existing, _)| existing == name)
            .ok_or_else(|| PackagingError::InvalidAssembly(format!("unknown dimension {name}")))
    }

    fn dim_id(&mut self, name: &str, size: usize) -> Result<usize, PackagingError> {
        if let Some(pos) = self.dims.iter().position(|(existing, _)| existing == name) {
            if self.dims[pos].1 as usize != size {
                return Err(PackagingError::InvalidAssembly(format!(
                    "dimension {name} declared with lengths {} and {size}",
                    self.dims[pos].1
                )));
            }
            return Ok(pos);
        }
        // a zero length marks the record dimension in this format
        let size = u32::try_from(size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                PackagingError::InvalidAssembly(format!(
                    "dimension {name} has unsupported length {size}"
                ))
            })?;
        self.dims.push((name.to_string(), size));
        Ok(self.dims.len() - 1)
    }
}

/// Serializes `assembly` to `path`. Multi-level indexes must have been
/// flattened with `DataAssembly::reset_index` first.
pub fn write_assembly(assembly: &DataAssembly, path: &Path) -> Result<(), PackagingError> {
    if let Some(index) = assembly.multi_indexes.first() {
        return Err(PackagingError::MultiIndexNotFlattened(index.dim.clone()));
    }
    assembly.validate()?;
    let file = layout(assembly)?;
    tracing::debug!(path = %path.display(), dims = file.dims.len(), variables = file.vars.len(), "writing netCDF");

    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".brainio-netcdf")
        .tempfile_in(parent)
        .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    {
        let mut out = BufWriter::new(temp.as_file());
        encode(&file, &mut out).map_err(|err| PackagingError::Filesystem(err.to_string()))?;
        out.flush()
            .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    }
    if path.exists() {
        fs::remove_file(path).map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    }
    temp.persist(path)
        .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    Ok(())
}

fn layout(assembly: &DataAssembly) -> Result<NcFile, PackagingError> {
    let mut file = NcFile::default();
    for dim in &assembly.dims {
        file.dim_id(&dim.name, dim.size)?;
    }

    let mut auxiliary = Vec::new();
    for coord in &assembly.coords {
        let mut dim_ids = coord
            .dims
            .iter()
            .map(|name| file.existing_dim(name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut attrs = Vec::new();
        let data = match &coord.values {
            CoordValues::Float(values) => Data::Double(values.clone()),
            CoordValues::Int(values) => Data::Int(
                values
                    .iter()
                    .map(|value| {
                        i32::try_from(*value).map_err(|_| PackagingError::ValueOutOfRange {
                            variable: coord.name.clone(),
                            value: value.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            CoordValues::Text(values) => {
                let width = values.iter().map(String::len).max().unwrap_or(0).max(1);
                dim_ids.push(file.dim_id(&format!("string{width}"), width)?);
                attrs.push(("_Encoding".to_string(), Data::Char(b"utf-8".to_vec())));
                let mut bytes = Vec::with_capacity(values.len() * width);
                for value in values {
                    bytes.extend_from_slice(value.as_bytes());
                    bytes.resize(bytes.len() + width - value.len(), 0);
                }
                Data::Char(bytes)
            }
        };
        if assembly.dim(&coord.name).is_none() {
            auxiliary.push(coord.name.as_str());
        }
        file.vars.push(Variable {
            name: coord.name.clone(),
            dim_ids,
            attrs,
            data,
        });
    }

    let mut attrs = assembly
        .attrs
        .iter()
        .map(|(name, value)| (name.clone(), Data::Char(value.as_bytes().to_vec())))
        .collect::<Vec<_>>();
    if !auxiliary.is_empty() {
        attrs.push((
            "coordinates".to_string(),
            Data::Char(auxiliary.join(" ").into_bytes()),
        ));
    }
    file.vars.push(Variable {
        name: DATA_VARIABLE.to_string(),
        dim_ids: (0..assembly.dims.len()).collect(),
        attrs,
        data: Data::Double(assembly.values.clone()),
    });
    Ok(file)
}

fn encode(file: &NcFile, out: &mut impl Write) -> std::io::Result<()> {
    let header_len = header(file, &vec![0; file.vars.len()]).len() as u64;
    let mut begins = Vec::with_capacity(file.vars.len());
    let mut offset = header_len;
    for var in &file.vars {
        begins.push(offset);
        offset += var.data.byte_len() + padding(var.data.byte_len()) as u64;
    }
    out.write_all(&header(file, &begins))?;
    for var in &file.vars {
        var.data.write_padded(out)?;
    }
    Ok(())
}

fn header(file: &NcFile, begins: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    put_u32(&mut buf, 0);

    if file.dims.is_empty() {
        put_absent(&mut buf);
    } else {
        put_u32(&mut buf, NC_DIMENSION);
        put_u32(&mut buf, file.dims.len() as u32);
        for (name, size) in &file.dims {
            put_name(&mut buf, name);
            put_u32(&mut buf, *size);
        }
    }

    // no global attributes
    put_absent(&mut buf);

    if file.vars.is_empty() {
        put_absent(&mut buf);
    } else {
        put_u32(&mut buf, NC_VARIABLE);
        put_u32(&mut buf, file.vars.len() as u32);
        for (var, begin) in file.vars.iter().zip(begins) {
            put_name(&mut buf, &var.name);
            put_u32(&mut buf, var.dim_ids.len() as u32);
            for dim_id in &var.dim_ids {
                put_u32(&mut buf, *dim_id as u32);
            }
            put_attrs(&mut buf, &var.attrs);
            put_u32(&mut buf, var.data.nc_type());
            let vsize = var.data.byte_len() + padding(var.data.byte_len()) as u64;
            put_u32(&mut buf, u32::try_from(vsize).unwrap_or(u32::MAX));
            buf.extend_from_slice(&begin.to_be_bytes());
        }
    }
    buf
}

fn put_attrs(buf: &mut Vec<u8>, attrs: &[(String, Data)]) {
    if attrs.is_empty() {
        put_absent(buf);
        return;
    }
    put_u32(buf, NC_ATTRIBUTE);
    put_u32(buf, attrs.len() as u32);
    for (name, data) in attrs {
        put_name(buf, name);
        put_u32(buf, data.nc_type());
        put_u32(buf, data.len() as u32);
        // writing into a Vec cannot fail
        let _ = data.write_padded(buf);
    }
}

fn put_name(buf: &mut Vec<u8>, name: &str) {
    put_u32(buf, name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&[0u8; 3][..padding(name.len() as u64)]);
}

fn put_absent(buf: &mut Vec<u8>) {
    put_u32(buf, 0);
    put_u32(buf, 0);
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn padding(len: u64) -> usize {
    ((4 - len % 4) % 4) as usize
}
