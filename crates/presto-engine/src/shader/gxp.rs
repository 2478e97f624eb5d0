use std::ffi::CStr;

const MAGIC: &[u8; 4] = b"GXP\0";
const HEADER_LEN: usize = 48;
const MAJOR_VERSION: u8 = 1;
const MIN_MINOR_VERSION: u8 = 4;

const SIZE_OFFSET: usize = 8;
const TYPE_OFFSET: usize = 20;
const PARAM_COUNT_OFFSET: usize = 36;
const PARAM_TABLE_OFFSET: usize = 40;
const PARAM_ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GxpError {
    #[error("program is {len} bytes, shorter than its header")]
    Truncated { len: usize },
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported program version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("declared size {declared} does not fit in {actual} bytes")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("parameter table ({count} entries at {offset:#x}) is out of bounds")]
    ParameterTableOutOfBounds { count: usize, offset: usize },
    #[error("parameter {index} has an invalid name")]
    BadParameterName { index: usize },
    #[error("parameter {index} has unknown category {category}")]
    UnknownCategory { index: usize, category: u8 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgramType {
    Vertex,
    Fragment,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParameterCategory {
    Attribute,
    Uniform,
    Sampler,
    AuxiliarySurface,
    UniformBuffer,
}

impl ParameterCategory {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Attribute,
            1 => Self::Uniform,
            2 => Self::Sampler,
            3 => Self::AuxiliarySurface,
            4 => Self::UniformBuffer,
            _ => return None,
        })
    }
}

/// One entry of a program's parameter table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProgramParameter<'a> {
    pub name: &'a str,
    pub category: ParameterCategory,
    /// Raw component type (0 is 32-bit float).
    pub component_type: u8,
    pub component_count: u8,
    /// Uniform buffer the parameter lives in; 14 is the default buffer.
    pub container_index: u8,
    pub semantic: u8,
    pub array_size: u32,
    /// Register index for attributes, float offset for uniforms, unit for
    /// samplers.
    pub resource_index: u32,
}

impl ProgramParameter<'_> {
    /// Number of 32-bit floats the parameter occupies in its container.
    pub fn float_count(&self) -> usize {
        self.component_count as usize * self.array_size.max(1) as usize
    }
}

/// A validated, read-only view over a compiled GXP program.
#[derive(Debug, Clone)]
pub struct Program<'a> {
    bytes: &'a [u8],
    program_type: ProgramType,
    parameters: Vec<ProgramParameter<'a>>,
}

impl<'a> Program<'a> {
    /// Validates the header and decodes the parameter table.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, GxpError> {
        if bytes.len() < HEADER_LEN {
            return Err(GxpError::Truncated { len: bytes.len() });
        }
        if &bytes[..4] != MAGIC {
            return Err(GxpError::BadMagic);
        }

        let (major, minor) = (bytes[4], bytes[5]);
        if major != MAJOR_VERSION || minor < MIN_MINOR_VERSION {
            return Err(GxpError::UnsupportedVersion { major, minor });
        }

        let declared = read_u32(bytes, SIZE_OFFSET) as usize;
        if declared < HEADER_LEN || declared > bytes.len() {
            return Err(GxpError::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        let bytes = &bytes[..declared];

        let program_type = if bytes[TYPE_OFFSET] & 1 == 0 {
            ProgramType::Vertex
        } else {
            ProgramType::Fragment
        };

        let parameters = parse_parameters(bytes)?;

        Ok(Self {
            bytes,
            program_type,
            parameters,
        })
    }

    #[inline]
    pub fn program_type(&self) -> ProgramType {
        self.program_type
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn parameters(&self) -> &[ProgramParameter<'a>] {
        &self.parameters
    }

    pub fn find_parameter(&self, name: &str) -> Option<&ProgramParameter<'a>> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

fn parse_parameters(bytes: &[u8]) -> Result<Vec<ProgramParameter<'_>>, GxpError> {
    let count = read_u32(bytes, PARAM_COUNT_OFFSET) as usize;
    let table = PARAM_TABLE_OFFSET + read_u32(bytes, PARAM_TABLE_OFFSET) as usize;

    let in_bounds = count
        .checked_mul(PARAM_ENTRY_LEN)
        .and_then(|len| table.checked_add(len))
        .is_some_and(|end| end <= bytes.len());
    if !in_bounds {
        return Err(GxpError::ParameterTableOutOfBounds {
            count,
            offset: table,
        });
    }

    (0..count)
        .map(|index| {
            let entry = table + index * PARAM_ENTRY_LEN;
            let name = read_name(bytes, entry).ok_or(GxpError::BadParameterName { index })?;

            let bits = u16::from_le_bytes([bytes[entry + 4], bytes[entry + 5]]);
            let category_bits = (bits & 0xF) as u8;
            let category = ParameterCategory::from_bits(category_bits).ok_or(
                GxpError::UnknownCategory {
                    index,
                    category: category_bits,
                },
            )?;

            Ok(ProgramParameter {
                name,
                category,
                component_type: ((bits >> 4) & 0xF) as u8,
                component_count: ((bits >> 8) & 0xF) as u8,
                container_index: ((bits >> 12) & 0xF) as u8,
                semantic: bytes[entry + 6],
                array_size: read_u32(bytes, entry + 8),
                resource_index: read_u32(bytes, entry + 12),
            })
        })
        .collect()
}

/// Names are NUL-terminated and addressed relative to their entry.
fn read_name(bytes: &[u8], entry: usize) -> Option<&str> {
    let rel = read_u32(bytes, entry) as i32;
    let start = entry.checked_add_signed(rel as isize)?;
    let tail = bytes.get(start..)?;
    CStr::from_bytes_until_nul(tail).ok()?.to_str().ok()
}

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &[u8] = include_bytes!("programs/texture_v.gxp");
    const FRAGMENT: &[u8] = include_bytes!("programs/texture_f.gxp");

    #[test]
    fn vertex_program_exposes_attributes_and_wvp() {
        let program = Program::parse(VERTEX).unwrap();
        assert_eq!(program.program_type(), ProgramType::Vertex);
        assert_eq!(program.size(), VERTEX.len());
        assert_eq!(program.parameters().len(), 3);

        let position = program.find_parameter("aPosition").unwrap();
        assert_eq!(position.category, ParameterCategory::Attribute);
        assert_eq!(position.resource_index, 0);

        let texcoord = program.find_parameter("aTexcoord").unwrap();
        assert_eq!(texcoord.category, ParameterCategory::Attribute);
        assert_eq!(texcoord.resource_index, 4);

        let wvp = program.find_parameter("wvp").unwrap();
        assert_eq!(wvp.category, ParameterCategory::Uniform);
        assert_eq!(wvp.container_index, 14);
        assert_eq!(wvp.float_count(), 16);

        assert!(program.find_parameter("tex").is_none());
    }

    #[test]
    fn fragment_program_has_one_sampler() {
        let program = Program::parse(FRAGMENT).unwrap();
        assert_eq!(program.program_type(), ProgramType::Fragment);

        let tex = program.find_parameter("tex").unwrap();
        assert_eq!(tex.category, ParameterCategory::Sampler);
        assert_eq!(tex.resource_index, 0);
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            Program::parse(&VERTEX[..16]).unwrap_err(),
            GxpError::Truncated { len: 16 }
        );

        let mut bad = VERTEX.to_vec();
        bad[0] = b'X';
        assert_eq!(Program::parse(&bad).unwrap_err(), GxpError::BadMagic);

        let mut old = VERTEX.to_vec();
        old[5] = 2;
        assert_eq!(
            Program::parse(&old).unwrap_err(),
            GxpError::UnsupportedVersion { major: 1, minor: 2 }
        );

        let short = &VERTEX[..VERTEX.len() - 1];
        assert!(matches!(
            Program::parse(short).unwrap_err(),
            GxpError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn rejects_parameter_table_past_the_end() {
        let mut bad = FRAGMENT.to_vec();
        bad[PARAM_COUNT_OFFSET..PARAM_COUNT_OFFSET + 4].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            Program::parse(&bad).unwrap_err(),
            GxpError::ParameterTableOutOfBounds { count: 100, .. }
        ));
    }
}
