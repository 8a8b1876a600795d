use std::io;

error_chain! {
    types {
        GuessError, GuessErrorKind, GuessResultExt, GuessResult;
    }

    foreign_links {
        Io(io::Error);
    }

    errors {
        InvalidGgepBlock {
            reason: String
        } {
            description("GGEP Extension Block Could Not Be Parsed")
            display("GGEP Extension Block Could Not Be Parsed: {}", reason)
        }
        QueryAlreadyRunning {
            muid: [u8; 16]
        } {
            description("A Query With This Muid Is Already Running")
            display("A Query With Muid {:?} Is Already Running", muid)
        }
        StoreUnavailable {
            description("Query Key Store Backing File Could Not Be Opened")
            display("Query Key Store Backing File Could Not Be Opened")
        }
    }
}
