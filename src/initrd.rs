//! USTAR boot archive lookup.
//!
//! The initrd is a plain tar archive; the kernel does a linear scan for
//! the one file it cares about and hands back a slice of the archive.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamError {
    EndOfStream,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitrdError {
    /// No entry with the requested name
    NotFound,
    /// The archive is not well-formed USTAR
    InvalidUStar,
}

/// A seekable reader over a memory-backed archive.
pub struct InputStream<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> InputStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn seek(&mut self, position: usize) -> &mut Self {
        self.position = position;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn read(&mut self, length: usize) -> Result<&'a [u8], StreamError> {
        let end = self
            .position
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or(StreamError::EndOfStream)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// A sub-stream over `[offset, offset + length)` of the same backing
    /// memory.
    pub fn slice(&self, offset: usize, length: usize) -> Result<&'a [u8], StreamError> {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or(StreamError::EndOfStream)?;
        Ok(&self.data[offset..end])
    }
}

const BLOCK_SIZE: usize = 512;
const NAME_LENGTH: usize = 100;
const SIZE_OFFSET: usize = 124;
const SIZE_LENGTH: usize = 11;
const MAGIC_OFFSET: usize = 257;

/// Linear scan of the archive for `filename`; on success the returned
/// slice covers exactly the file's contents.
pub fn lookup<'a>(archive: &InputStream<'a>, filename: &str) -> Result<&'a [u8], InitrdError> {
    let mut entry_offset = 0;

    loop {
        let mut stream = InputStream {
            data: archive.data,
            position: entry_offset,
        };

        let name = match stream.read(NAME_LENGTH) {
            Ok(name) => name,
            // Ran off the end between entries: the file simply is not here
            Err(StreamError::EndOfStream) => return Err(InitrdError::NotFound),
        };
        if name[0] == 0 {
            // Terminating zero block
            return Err(InitrdError::NotFound);
        }

        let magic = stream
            .seek(entry_offset + MAGIC_OFFSET)
            .read(5)
            .map_err(|_| InitrdError::InvalidUStar)?;
        if magic != b"ustar" {
            return Err(InitrdError::InvalidUStar);
        }

        let size_field = stream
            .seek(entry_offset + SIZE_OFFSET)
            .read(SIZE_LENGTH)
            .map_err(|_| InitrdError::InvalidUStar)?;
        let file_size = oct2bin(size_field).ok_or(InitrdError::InvalidUStar)?;

        if name_matches(name, filename) {
            return archive
                .slice(entry_offset + BLOCK_SIZE, file_size)
                .map_err(|_| InitrdError::InvalidUStar);
        }

        entry_offset += (file_size.div_ceil(BLOCK_SIZE) + 1) * BLOCK_SIZE;
    }
}

fn name_matches(field: &[u8], filename: &str) -> bool {
    let terminated = field.split(|&b| b == 0).next().unwrap_or(field);
    terminated == filename.as_bytes()
}

fn oct2bin(digits: &[u8]) -> Option<usize> {
    let mut value = 0usize;
    for &digit in digits {
        match digit {
            b'0'..=b'7' => value = value * 8 + (digit - b'0') as usize,
            // The size field may be space- or NUL-terminated early
            b' ' | 0 => break,
            _ => return None,
        }
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_entry(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut entry = vec![0u8; BLOCK_SIZE];
        entry[..name.len()].copy_from_slice(name.as_bytes());
        let size = format!("{:011o}", contents.len());
        entry[SIZE_OFFSET..SIZE_OFFSET + SIZE_LENGTH].copy_from_slice(size.as_bytes());
        entry[MAGIC_OFFSET..MAGIC_OFFSET + 6].copy_from_slice(b"ustar\0");

        entry.extend_from_slice(contents);
        let padding = contents.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - contents.len();
        entry.extend(core::iter::repeat(0).take(padding));
        entry
    }

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (name, contents) in entries {
            data.extend(tar_entry(name, contents));
        }
        // Two terminating zero blocks
        data.extend(core::iter::repeat(0).take(2 * BLOCK_SIZE));
        data
    }

    #[test]
    fn finds_a_file_by_linear_scan() {
        let data = archive(&[
            ("boot/config", b"x=1\n"),
            ("serial.elf", b"\x7fELF service"),
            ("readme", b"hello"),
        ]);
        let stream = InputStream::new(&data);

        assert_eq!(
            lookup(&stream, "serial.elf").unwrap(),
            b"\x7fELF service"
        );
        assert_eq!(lookup(&stream, "readme").unwrap(), b"hello");
    }

    #[test]
    fn missing_files_are_not_found() {
        let data = archive(&[("serial.elf", b"svc")]);
        let stream = InputStream::new(&data);

        assert_eq!(lookup(&stream, "missing"), Err(InitrdError::NotFound));
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut data = archive(&[("serial.elf", b"svc")]);
        data[MAGIC_OFFSET] = b'X';
        let stream = InputStream::new(&data);

        assert_eq!(lookup(&stream, "serial.elf"), Err(InitrdError::InvalidUStar));
    }

    #[test]
    fn corrupt_size_field_is_rejected() {
        let mut data = archive(&[("serial.elf", b"svc")]);
        data[SIZE_OFFSET] = b'9';
        let stream = InputStream::new(&data);

        assert_eq!(lookup(&stream, "serial.elf"), Err(InitrdError::InvalidUStar));
    }

    #[test]
    fn truncated_archives_do_not_read_out_of_bounds() {
        let data = archive(&[("serial.elf", b"0123456789")]);
        // Cut the file data short
        let stream = InputStream::new(&data[..BLOCK_SIZE + 4]);

        assert_eq!(lookup(&stream, "serial.elf"), Err(InitrdError::InvalidUStar));
    }

    #[test]
    fn streams_bound_their_reads() {
        let data = [1u8, 2, 3, 4];
        let mut stream = InputStream::new(&data);

        assert_eq!(stream.read(3).unwrap(), &[1, 2, 3]);
        assert_eq!(stream.position(), 3);
        assert_eq!(stream.read(2), Err(StreamError::EndOfStream));
        assert_eq!(stream.seek(2).read(2).unwrap(), &[3, 4]);
    }
}
