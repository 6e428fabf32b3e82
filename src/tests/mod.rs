//! Shared fixtures and end-to-end tests through the HTTP surface.
