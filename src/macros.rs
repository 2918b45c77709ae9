macro_rules! dispatch_arch {
    ($type:ident: $arch:expr => $expr:expr) => {{
        use crate::arch::{Arch, Avr, Hosted};

        match $arch {
            Arch::Avr => {
                type $type = Avr;
                $expr
            }

            Arch::Hosted => {
                type $type = Hosted;
                $expr
            }
        }
    }};
}

macro_rules! emit {
    ($output:expr) => {
        writeln!($output)
    };

    ($output:expr, $($format:tt)*) => {{
        write!($output, "\t")?;
        writeln!($output, $($format)*)
    }};
}
