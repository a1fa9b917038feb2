crate::define_tag_enum! {
    /// Package-manager ecosystem supported for resolution
    Ecosystem {
        Gomod => "gomod" : "Go modules" | "go-mod",
        Npm => "npm" : "npm",
        Pip => "pip" : "pip",
    }
}
