// Service-level test modules
// Unit tests live next to their source; everything here runs against the
// in-process stub verification server from `support`.

mod outdated_tests;
mod support;
