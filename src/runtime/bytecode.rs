//! Compiled task images.
//!
//! Boa exposes no serialised bytecode form, so a compiled task is a framed
//! copy of the module source: a magic header, a little-endian length, and
//! the UTF-8 body. `compile_script` parses the module in a scratch context
//! first, so malformed sources fail at compile time rather than on a worker.

use boa_engine::{Context, Module, Source};

use super::RuntimeError;

const IMAGE_MAGIC: [u8; 4] = *b"KBC1";
const HEADER_LEN: usize = IMAGE_MAGIC.len() + 4;

/// Compile a module source into a task image suitable for
/// `add_bytecode_task`.
pub fn compile_script(source: &str) -> Result<Vec<u8>, RuntimeError> {
    let mut scratch = Context::default();
    Module::parse(Source::from_bytes(source.as_bytes()), None, &mut scratch)
        .map_err(|err| RuntimeError::Js(err.to_string()))?;

    let body = source.as_bytes();
    let mut image = Vec::with_capacity(HEADER_LEN + body.len());
    image.extend_from_slice(&IMAGE_MAGIC);
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(body);
    Ok(image)
}

/// Recover the module source from a task image.
pub(crate) fn decode(image: &[u8]) -> Result<&str, RuntimeError> {
    if image.len() < HEADER_LEN || image[..IMAGE_MAGIC.len()] != IMAGE_MAGIC {
        return Err(RuntimeError::Bytecode("missing image header".into()));
    }
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&image[IMAGE_MAGIC.len()..HEADER_LEN]);
    let length = u32::from_le_bytes(length_bytes) as usize;

    let body = &image[HEADER_LEN..];
    if body.len() != length {
        return Err(RuntimeError::Bytecode("truncated image".into()));
    }
    std::str::from_utf8(body)
        .map_err(|_| RuntimeError::Bytecode("image body is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trips() {
        let source = "const answer = 6 * 7;";
        let image = compile_script(source).unwrap();
        assert_eq!(decode(&image).unwrap(), source);
    }

    #[test]
    fn invalid_source_fails_at_compile_time() {
        assert!(compile_script("const const = 1;").is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = compile_script("1").unwrap();
        image[0] = b'X';
        assert!(decode(&image).is_err());
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = compile_script("1 + 1").unwrap();
        assert!(decode(&image[..image.len() - 1]).is_err());
        assert!(decode(&[]).is_err());
    }
}
