use std::io;

error_chain! {
    types {
        TrailerError, TrailerErrorKind, TrailerResultExt, TrailerResult;
    }

    foreign_links {
        Io(io::Error);
    }

    errors {
        BadMagic {
            found: [u8; 4]
        } {
            description("Trailer Magic Did Not Match, File Does Not Carry A Trailer")
            display("Trailer Magic Did Not Match, Found {:?}", found)
        }
        BadChecksum {
            description("Trailer Checksum Did Not Validate, Trailer Is Corrupt")
            display("Trailer Checksum Did Not Validate, Trailer Is Corrupt")
        }
        UnsupportedVersion {
            found: u8
        } {
            description("Trailer Version Is Not Supported By This Build")
            display("Trailer Version {} Is Not Supported By This Build", found)
        }
    }
}

error_chain! {
    types {
        ChunkError, ChunkErrorKind, ChunkResultExt, ChunkResult;
    }

    foreign_links {
        Trailer(TrailerError);
        Io(io::Error);
    }

    errors {
        RangeOutOfBounds {
            from: u64,
            to: u64,
            size: u64
        } {
            description("Requested Chunk Range Falls Outside Of The File Size")
            display("Requested Chunk Range [{}, {}) Falls Outside Of The File Size {}", from, to, size)
        }
        SizeAlreadyKnown {
            size: u64
        } {
            description("Cannot Resize A File Whose Size Is Already Known")
            display("Cannot Resize A File Whose Size ({}) Is Already Known", size)
        }
    }
}
