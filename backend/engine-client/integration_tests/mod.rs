mod engine_tests {
    pub mod helpers;
}

mod bytecode {
    mod cancellation;
    mod host;
    mod sessions;
}

mod client {
    mod facade;
}

mod delegated {
    mod socket;
}
