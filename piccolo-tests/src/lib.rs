//! End-to-end tests of the Piccolo clients against a loopback server.
