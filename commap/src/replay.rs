//! Trace replay format
//!
//! Binary event traces as emitted by the instrumentation frontend: a magic,
//! a header with the record count, then variable-length records tagged by a
//! kind byte.

// Imports
use {
	anyhow::Context,
	byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
	commap_util::ReadByteArray,
	std::io,
};

/// Magic
pub const MAGIC: [u8; 8] = *b"CMAP v0\0";

/// Trace reader
#[derive(Clone, Debug)]
pub struct TraceReader<R> {
	/// Header
	_header: Header,

	/// Records remaining
	records_remaining: u64,

	/// Reader
	reader: R,
}

impl<R: io::Read> TraceReader<R> {
	/// Parses a trace from a reader
	pub fn from_reader(mut reader: R) -> Result<Self, anyhow::Error> {
		// Read the magic
		let magic = reader.read_byte_array().context("Unable to read magic")?;
		anyhow::ensure!(magic == MAGIC, "Found wrong magic {magic:?}, expected {MAGIC:?}");

		// Read the header
		let header = Header::from_reader(&mut reader).context("Unable to read header")?;
		tracing::trace!(?header, "Parsed header");

		Ok(Self {
			records_remaining: header.records,
			_header: header,
			reader,
		})
	}

	/// Reads the next record
	pub fn read_next(&mut self) -> Result<Option<Record>, anyhow::Error> {
		// If we're done, return `None`
		if self.records_remaining == 0 {
			return Ok(None);
		}

		// Else parse the next record and reduce the remaining records
		let record = Record::from_reader(&mut self.reader).context("Unable to read record")?;
		self.records_remaining -= 1;

		Ok(Some(record))
	}

	/// Returns the remaining records
	pub fn records_remaining(&self) -> u64 {
		self.records_remaining
	}
}

/// Trace writer
#[derive(Clone, Debug)]
pub struct TraceWriter<W> {
	/// Records written
	records_written: u64,

	/// Writer
	writer: W,
}

impl<W: io::Write + io::Seek> TraceWriter<W> {
	/// Creates a new writer.
	///
	/// The header is written last, so we rewind to the start, reserve its
	/// space and come back in [`Self::finish`].
	pub fn new(mut writer: W) -> Result<Self, anyhow::Error> {
		writer.rewind().context("Unable to rewind to start")?;
		writer.write_all(&MAGIC).context("Unable to write magic")?;
		writer
			.seek(io::SeekFrom::Current(Header::BYTE_SIZE as i64))
			.context("Unable to seek past header")?;

		Ok(Self {
			writer,
			records_written: 0,
		})
	}

	/// Writes a record
	pub fn write(&mut self, record: &Record) -> Result<(), anyhow::Error> {
		record.to_writer(&mut self.writer).context("Unable to write record")?;

		self.records_written += 1;
		Ok(())
	}

	/// Finishes writing by going back and filling in the header
	pub fn finish(mut self) -> Result<W, anyhow::Error> {
		self.writer
			.seek(io::SeekFrom::Start(MAGIC.len() as u64))
			.context("Unable to seek to header")?;

		let header = Header {
			records: self.records_written,
		};
		header.to_writer(&mut self.writer).context("Unable to write header")?;

		Ok(self.writer)
	}
}

/// Header
#[derive(Clone, Copy, Debug)]
pub struct Header {
	/// Total records
	records: u64,
}

impl Header {
	/// Returns the size of this header (including any padding)
	pub const BYTE_SIZE: usize = 0x10;

	/// Parses a header from a reader
	pub fn from_reader<R: io::Read>(reader: &mut R) -> Result<Self, anyhow::Error> {
		let records = reader.read_u64::<LittleEndian>().context("Unable to read records")?;

		// Then read over the padding
		let _: [u8; 8] = reader.read_byte_array().context("Unable to read padding")?;

		Ok(Self { records })
	}

	/// Writes a header to a writer
	pub fn to_writer<W: io::Write>(&self, writer: &mut W) -> Result<(), anyhow::Error> {
		writer
			.write_u64::<LittleEndian>(self.records)
			.context("Unable to write records")?;
		writer.write_all(&[0; 8]).context("Unable to write padding")?;

		Ok(())
	}
}

/// Trace record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
	/// Memory read
	MemRead {
		/// Reading thread
		tid: u64,

		/// Address
		addr: u64,

		/// Access size, in bytes
		size: u32,
	},

	/// Memory write
	MemWrite {
		/// Writing thread
		tid: u64,

		/// Address
		addr: u64,

		/// Access size, in bytes
		size: u32,
	},

	/// Routine entry
	RoutineEnter {
		/// Entering thread
		tid: u64,

		/// Routine id
		routine: u64,
	},

	/// Routine exit
	RoutineExit {
		/// Exiting thread
		tid: u64,

		/// Routine id
		routine: u64,
	},

	/// Thread spawn
	ThreadCreate {
		/// Spawning thread
		parent: u64,

		/// Spawned thread
		child: u64,
	},

	/// Region-of-interest begin
	RoiBegin,

	/// Region-of-interest end
	RoiEnd,

	/// Routine name registration
	RoutineName {
		/// Routine id
		routine: u64,

		/// Routine name
		name: String,
	},
}

impl Record {
	/// Parses a record from a reader
	pub fn from_reader<R: io::Read>(reader: &mut R) -> Result<Self, anyhow::Error> {
		let kind = reader.read_u8().context("Unable to read record kind")?;
		let record = match kind {
			0 | 1 => {
				let tid = reader.read_u64::<LittleEndian>().context("Unable to read thread")?;
				let addr = reader.read_u64::<LittleEndian>().context("Unable to read address")?;
				let size = reader.read_u32::<LittleEndian>().context("Unable to read size")?;
				match kind {
					0 => Self::MemRead { tid, addr, size },
					_ => Self::MemWrite { tid, addr, size },
				}
			},
			2 | 3 => {
				let tid = reader.read_u64::<LittleEndian>().context("Unable to read thread")?;
				let routine = reader.read_u64::<LittleEndian>().context("Unable to read routine")?;
				match kind {
					2 => Self::RoutineEnter { tid, routine },
					_ => Self::RoutineExit { tid, routine },
				}
			},
			4 => {
				let parent = reader.read_u64::<LittleEndian>().context("Unable to read parent")?;
				let child = reader.read_u64::<LittleEndian>().context("Unable to read child")?;
				Self::ThreadCreate { parent, child }
			},
			5 => Self::RoiBegin,
			6 => Self::RoiEnd,
			7 => {
				let routine = reader.read_u64::<LittleEndian>().context("Unable to read routine")?;
				let len = reader.read_u16::<LittleEndian>().context("Unable to read name length")?;
				let mut name = vec![0; usize::from(len)];
				reader.read_exact(&mut name).context("Unable to read name")?;
				let name = String::from_utf8(name).context("Routine name isn't utf-8")?;
				Self::RoutineName { routine, name }
			},
			kind => anyhow::bail!("Unknown record kind: {kind}"),
		};

		Ok(record)
	}

	/// Writes a record to a writer
	pub fn to_writer<W: io::Write>(&self, writer: &mut W) -> Result<(), anyhow::Error> {
		match *self {
			Self::MemRead { tid, addr, size } | Self::MemWrite { tid, addr, size } => {
				let kind = match self {
					Self::MemRead { .. } => 0,
					_ => 1,
				};
				writer.write_u8(kind).context("Unable to write record kind")?;
				writer.write_u64::<LittleEndian>(tid).context("Unable to write thread")?;
				writer
					.write_u64::<LittleEndian>(addr)
					.context("Unable to write address")?;
				writer.write_u32::<LittleEndian>(size).context("Unable to write size")?;
			},
			Self::RoutineEnter { tid, routine } | Self::RoutineExit { tid, routine } => {
				let kind = match self {
					Self::RoutineEnter { .. } => 2,
					_ => 3,
				};
				writer.write_u8(kind).context("Unable to write record kind")?;
				writer.write_u64::<LittleEndian>(tid).context("Unable to write thread")?;
				writer
					.write_u64::<LittleEndian>(routine)
					.context("Unable to write routine")?;
			},
			Self::ThreadCreate { parent, child } => {
				writer.write_u8(4).context("Unable to write record kind")?;
				writer
					.write_u64::<LittleEndian>(parent)
					.context("Unable to write parent")?;
				writer.write_u64::<LittleEndian>(child).context("Unable to write child")?;
			},
			Self::RoiBegin => writer.write_u8(5).context("Unable to write record kind")?,
			Self::RoiEnd => writer.write_u8(6).context("Unable to write record kind")?,
			Self::RoutineName { routine, ref name } => {
				writer.write_u8(7).context("Unable to write record kind")?;
				writer
					.write_u64::<LittleEndian>(routine)
					.context("Unable to write routine")?;
				let len = u16::try_from(name.len()).context("Routine name too long")?;
				writer.write_u16::<LittleEndian>(len).context("Unable to write name length")?;
				writer.write_all(name.as_bytes()).context("Unable to write name")?;
			},
		}

		Ok(())
	}

	/// Returns if this record is a memory access
	pub fn is_mem_access(&self) -> bool {
		matches!(self, Self::MemRead { .. } | Self::MemWrite { .. })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip() {
		let records = vec![
			Record::RoutineName {
				routine: 7,
				name:    "compute".to_owned(),
			},
			Record::RoiBegin,
			Record::RoutineEnter { tid: 100, routine: 7 },
			Record::MemWrite {
				tid:  100,
				addr: 0x1000,
				size: 8,
			},
			Record::ThreadCreate { parent: 100, child: 200 },
			Record::MemRead {
				tid:  200,
				addr: 0x1000,
				size: 64,
			},
			Record::RoutineExit { tid: 100, routine: 7 },
			Record::RoiEnd,
		];

		let mut writer = TraceWriter::new(io::Cursor::new(Vec::new())).expect("Unable to create writer");
		for record in &records {
			writer.write(record).expect("Unable to write record");
		}
		let buf = writer.finish().expect("Unable to finish").into_inner();

		let mut reader = TraceReader::from_reader(io::Cursor::new(buf)).expect("Unable to create reader");
		assert_eq!(reader.records_remaining(), records.len() as u64);

		let mut parsed = Vec::new();
		while let Some(record) = reader.read_next().expect("Unable to read record") {
			parsed.push(record);
		}
		assert_eq!(parsed, records);
	}

	#[test]
	fn wrong_magic_is_rejected() {
		let reader = TraceReader::from_reader(io::Cursor::new(*b"PINT v0\0"));
		assert!(reader.is_err());
	}
}
